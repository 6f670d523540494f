use std::future::Future;
use std::ops::Range;
use std::path::Path;

/// Binary file mapped into the debuggee, as seen by the dispatcher when
/// resolving breakpoint locations.
pub trait MappedBinary {
    /// Error returned on symbol lookup failures.
    type Error;

    /// Range of addresses spanned by all the mappings of the binary.
    fn addr_range(&self) -> &Range<u64>;

    /// File name of the binary (e.g., `libc.so.6`), as matched by
    /// `binary!symbol` locations.
    fn file_name(&self) -> &str;

    /// Path of the mapped file.
    fn path(&self) -> &Path;

    /// Returns whether the given address lies within the binary.
    fn contains(&self, addr: u64) -> bool {
        self.addr_range().contains(&addr)
    }

    /// Returns the absolute address of the given symbol, if the binary
    /// defines it.
    fn addr_of_symbol(
        &mut self,
        symbol: &str,
    ) -> impl Future<Output = Result<Option<u64>, Self::Error>>;

    /// Returns the name of the symbol containing the given address, along
    /// with the offset of the address from the start of the symbol.
    fn symbol_of_addr(
        &mut self,
        addr: u64,
    ) -> impl Future<Output = Result<Option<(String, u64)>, Self::Error>>;
}
