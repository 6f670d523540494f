use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Command line of a debuggee to spawn.
#[derive(Debug, Clone)]
pub struct Command {
    /// Program to spawn.
    pub program: PathBuf,

    /// Program arguments.
    pub args: Vec<String>,

    /// Environment variables of the debuggee.
    pub env: CommandEnv,

    /// Working directory of the debuggee.
    pub current_dir: Option<PathBuf>,
}

impl Command {
    /// Constructs a new `Command` for launching the program at path
    /// `program`, with no arguments, inheriting the environment and the
    /// working directory of the current process.
    ///
    /// If `program` is not an absolute path, the `PATH` is searched.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: CommandEnv::Inherit(BTreeMap::new()),
            current_dir: None,
        }
    }

    /// Adds an argument to pass to the program.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to pass to the program.
    pub fn args<I, S>(self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        args.into_iter().fold(self, |cmd, arg| cmd.arg(arg))
    }

    /// Inserts or updates an environment variable of the debuggee.
    ///
    /// Explicitly set variables take precedence over inherited ones.
    pub fn env<K, V>(mut self, key: K, val: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        match self.env {
            CommandEnv::Inherit(ref mut env) => {
                env.insert(key.into(), Some(val.into()));
            }
            CommandEnv::NoInherit(ref mut env) => {
                env.insert(key.into(), val.into());
            }
        }

        self
    }

    /// Inserts or updates multiple environment variables of the debuggee.
    pub fn envs<I, K, V>(self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        vars.into_iter().fold(self, |cmd, (k, v)| cmd.env(k, v))
    }

    /// Removes an environment variable, even if it would be inherited.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        match self.env {
            CommandEnv::Inherit(ref mut env) => {
                env.insert(key.into(), None);
            }
            CommandEnv::NoInherit(ref mut env) => {
                env.remove(&key.into());
            }
        }

        self
    }

    /// Clears all environment variables and disables inheritance.
    pub fn env_clear(mut self) -> Self {
        self.env = CommandEnv::NoInherit(BTreeMap::new());
        self
    }

    /// Sets the working directory of the debuggee.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;

        for arg in self.args.iter() {
            write!(f, " {arg}")?;
        }

        Ok(())
    }
}

/// Environment variables attached to a [Command].
#[derive(Debug, Clone)]
pub enum CommandEnv {
    /// Variables added to the inherited environment.
    ///
    /// A `None` value removes the variable, even if it was inherited.
    Inherit(BTreeMap<String, Option<String>>),

    /// Variables of the debuggee, nothing is inherited.
    NoInherit(BTreeMap<String, String>),
}

impl CommandEnv {
    /// Captures the current environment with the specified changes applied.
    ///
    /// `None` is returned when the environment is inherited untouched.
    pub fn captured(&self) -> Option<BTreeMap<String, String>> {
        let mut captured_env = BTreeMap::new();

        match self {
            Self::Inherit(env) if env.is_empty() => return None,
            Self::Inherit(env) => {
                captured_env.extend(std::env::vars());
                for (k, v) in env {
                    if let Some(v) = v {
                        captured_env.insert(k.clone(), v.clone());
                    } else {
                        captured_env.remove(k);
                    }
                }
            }
            Self::NoInherit(env) => {
                captured_env.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        Some(captured_env)
    }
}
