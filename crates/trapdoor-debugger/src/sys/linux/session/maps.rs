use std::ops::Range;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

/// File mapped into a process' address space.
#[derive(Debug, PartialEq, Eq)]
pub struct MappedFile {
    /// Address range spanned by all the mappings of the file.
    pub addr_range: Range<u64>,

    pub path: PathBuf,
}

/// Enumerates the files mapped into the address space of the given process.
///
/// The files are ordered by address, except for `exe_path` which comes first.
pub async fn mapped_files(pid: Pid, exe_path: &Path) -> crate::sys::Result<Vec<MappedFile>> {
    let path: PathBuf = format!("/proc/{pid}/maps").into();

    let maps = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| crate::sys::Error::File(path, e))?;

    let mut files = parse_maps(&maps)?;

    if let Some(i) = files.iter().position(|file| file.path == exe_path) {
        let exe = files.remove(i);
        files.insert(0, exe);
    }

    Ok(files)
}

fn parse_maps(maps: &str) -> crate::sys::Result<Vec<MappedFile>> {
    let mut files: Vec<MappedFile> = Vec::new();

    for line in maps.lines().filter(|line| !line.trim().is_empty()) {
        let malformed = || crate::sys::Error::MalformedMapping(line.to_owned());

        // address, perms, offset, dev, inode, then the (optional) path
        let mut fields = [""; 5];
        let mut rest = line;

        for field in fields.iter_mut() {
            rest = rest.trim_start();

            let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
            (*field, rest) = rest.split_at(end);

            if field.is_empty() {
                return Err(malformed());
            }
        }

        let path = rest.trim();

        // anonymous mappings, pseudo-files ([vdso], [stack], ...) and deleted files
        if !path.starts_with('/') || path.ends_with(" (deleted)") {
            continue;
        }

        let (start, end) = fields[0]
            .split_once('-')
            .and_then(|(start, end)| {
                Some((
                    u64::from_str_radix(start, 16).ok()?,
                    u64::from_str_radix(end, 16).ok()?,
                ))
            })
            .ok_or_else(malformed)?;

        match files.iter_mut().find(|file| file.path == Path::new(path)) {
            Some(file) => {
                file.addr_range.start = file.addr_range.start.min(start);
                file.addr_range.end = file.addr_range.end.max(end);
            }
            None => files.push(MappedFile {
                addr_range: start..end,
                path: path.into(),
            }),
        }
    }

    Ok(files)
}
