use std::path::PathBuf;

use futures_util::TryStreamExt;
use nix::unistd::Pid;
use scroll::{Endian, Pread};
use tokio::fs::File;
use tokio::io::BufReader;
use tokio_util::bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, FramedRead};

const ENTRY_SIZE: usize = 2 * std::mem::size_of::<u64>();

/// Looks up the given entry of the process' auxiliary vector.
pub async fn auxv_value(pid: Pid, endian: Endian, ty: u64) -> crate::sys::Result<Option<u64>> {
    let path: PathBuf = format!("/proc/{pid}/auxv").into();

    let reader = File::open(&path)
        .await
        .map(BufReader::new)
        .map_err(|e| crate::sys::Error::File(path, e))?;

    let mut entries = FramedRead::new(reader, AuxvDecoder { endian });

    while let Some((entry_ty, value)) = entries.try_next().await? {
        if entry_ty == ty {
            return Ok(Some(value));
        }

        if entry_ty == nix::libc::AT_NULL {
            break;
        }
    }

    Ok(None)
}

/// Decoder of 64-bit auxiliary vector entries.
struct AuxvDecoder {
    endian: Endian,
}

impl Decoder for AuxvDecoder {
    type Item = (u64, u64);
    type Error = crate::sys::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < ENTRY_SIZE {
            return Ok(None);
        }

        let mut offset = 0;

        let ty: u64 = src
            .gread_with(&mut offset, self.endian)
            .map_err(goblin::error::Error::from)?;
        let value: u64 = src
            .gread_with(&mut offset, self.endian)
            .map_err(goblin::error::Error::from)?;

        src.advance(ENTRY_SIZE);

        Ok(Some((ty, value)))
    }
}
