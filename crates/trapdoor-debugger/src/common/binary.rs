use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::Instrument;
use trapdoor_dispatch::debugger::MappedBinary;
use wholesym::{LookupAddress, SymbolManager, SymbolMap};

/// Binary file mapped into the debuggee's address space.
///
/// Symbols are loaded on first use.
pub struct MappedElf {
    /// Address range spanned by the binary's mappings.
    addr_range: Range<u64>,

    file_name: String,
    path: PathBuf,

    symbol_manager: Arc<SymbolManager>,
    symbol_map: Option<SymbolMap>,
}

impl MappedElf {
    pub(crate) fn new(
        addr_range: Range<u64>,
        path: PathBuf,
        symbol_manager: Arc<SymbolManager>,
    ) -> Self {
        let file_name = path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned();

        Self {
            addr_range,
            file_name,
            path,
            symbol_manager,
            symbol_map: None,
        }
    }

    async fn symbol_map(&mut self) -> crate::Result<&SymbolMap> {
        let symbol_map = match self.symbol_map.take() {
            Some(symbol_map) => symbol_map,
            None => {
                self.symbol_manager
                    .load_symbol_map_for_binary_at_path(&self.path, None)
                    .instrument(tracing::info_span!("LoadSymbols", binary = self.file_name))
                    .await?
            }
        };

        Ok(self.symbol_map.insert(symbol_map))
    }
}

impl MappedBinary for MappedElf {
    type Error = crate::Error;

    fn addr_range(&self) -> &Range<u64> {
        &self.addr_range
    }

    fn file_name(&self) -> &str {
        &self.file_name
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn addr_of_symbol(&mut self, symbol: &str) -> crate::Result<Option<u64>> {
        let base_addr = self.addr_range.start;

        let offset = self
            .symbol_map()
            .await?
            .iter_symbols()
            .find_map(|(offset, name)| (name == symbol).then_some(offset));

        Ok(offset.map(|offset| base_addr + offset as u64))
    }

    async fn symbol_of_addr(&mut self, addr: u64) -> crate::Result<Option<(String, u64)>> {
        if !self.contains(addr) {
            return Ok(None);
        }

        let base_addr = self.addr_range.start;

        let Ok(rela_addr) = u32::try_from(addr - base_addr) else {
            return Ok(None);
        };

        let Some(info) = self
            .symbol_map()
            .await?
            .lookup(LookupAddress::Relative(rela_addr))
            .await
        else {
            return Ok(None);
        };

        let sym_addr = base_addr + info.symbol.address as u64;

        Ok(Some((info.symbol.name, addr - sym_addr)))
    }
}
