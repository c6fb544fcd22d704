use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use object::{Object, ObjectKind, ObjectSegment};

use crate::model::Mapping;
use crate::services::debuginfo::{
    AddressResult, DebugInfoResolver, FrameError, ResolveError, ResolvedFrame,
};

/// Resolves addresses from debug files stored as `<root>/<build_id>/debuginfo`.
///
/// DWARF is read with `addr2line`; the work runs on the blocking pool so the
/// async runtime is never stalled by file parsing.
#[derive(Debug, Clone)]
pub struct FilesystemResolver {
    root: PathBuf,
}

impl FilesystemResolver {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn debuginfo_path(&self, build_id: &str) -> PathBuf {
        self.root.join(build_id).join("debuginfo")
    }
}

#[async_trait]
impl DebugInfoResolver for FilesystemResolver {
    async fn resolve(
        &self,
        mapping: &Mapping,
        addresses: &[u64],
    ) -> Result<HashMap<u64, AddressResult>, ResolveError> {
        // Build ids are used as a path component; refuse anything that could escape `root`.
        if mapping.build_id.is_empty()
            || !mapping.build_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ResolveError::BinaryNotAvailable { build_id: mapping.build_id.clone() });
        }

        let path = self.debuginfo_path(&mapping.build_id);
        if !path.is_file() {
            return Err(ResolveError::BinaryNotAvailable { build_id: mapping.build_id.clone() });
        }

        let mapping = mapping.clone();
        let addresses = addresses.to_vec();
        tokio::task::spawn_blocking(move || resolve_blocking(&path, &mapping, &addresses))
            .await
            .map_err(|e| ResolveError::Unavailable(format!("resolver task failed: {e}")))?
    }
}

fn resolve_blocking(
    path: &Path,
    mapping: &Mapping,
    addresses: &[u64],
) -> Result<HashMap<u64, AddressResult>, ResolveError> {
    let data = std::fs::read(path)
        .map_err(|e| ResolveError::Unavailable(format!("failed to read {}: {e}", path.display())))?;
    let normalizer = AddressNormalizer::new(&data, mapping)?;

    let loader = addr2line::Loader::new(path).map_err(|e| {
        ResolveError::Unavailable(format!("failed to load debug info {}: {e}", path.display()))
    })?;

    let mut out = HashMap::with_capacity(addresses.len());
    for &address in addresses {
        let file_address = normalizer.normalize(address);
        out.insert(address, frames_for(&loader, address, file_address));
    }
    Ok(out)
}

fn frames_for(loader: &addr2line::Loader, address: u64, file_address: u64) -> AddressResult {
    let corrupt = |reason: String| FrameError { address, reason };

    let mut iter = loader.find_frames(file_address).map_err(|e| corrupt(e.to_string()))?;
    let mut frames = Vec::new();
    while let Some(frame) = iter.next().map_err(|e| corrupt(e.to_string()))? {
        let (function_name, system_name) = match &frame.function {
            Some(name) => {
                let raw = name.raw_name().map_err(|e| corrupt(e.to_string()))?;
                let demangled = name.demangle().map_err(|e| corrupt(e.to_string()))?;
                (demangled.into_owned(), raw.into_owned())
            }
            None => (String::new(), String::new()),
        };
        let (filename, line) = match &frame.location {
            Some(location) => {
                (location.file.unwrap_or_default().to_string(), location.line.unwrap_or(0) as i64)
            }
            None => (String::new(), 0),
        };
        frames.push(ResolvedFrame { function_name, system_name, filename, start_line: 0, line });
    }

    // No DWARF for this address: fall back to the symbol table, which at least names the function.
    if frames.is_empty() {
        if let Some(symbol) = loader.find_symbol(file_address) {
            frames.push(ResolvedFrame {
                function_name: symbol.to_string(),
                system_name: symbol.to_string(),
                filename: String::new(),
                start_line: 0,
                line: 0,
            });
        }
    }
    Ok(frames)
}

/// Translates runtime addresses into the object file's virtual address space.
enum AddressNormalizer {
    Identity,
    Shift { runtime_start: u64, file_vaddr: u64 },
}

impl AddressNormalizer {
    fn new(data: &[u8], mapping: &Mapping) -> Result<Self, ResolveError> {
        let file = object::File::parse(data)
            .map_err(|e| ResolveError::Unavailable(format!("failed to parse object: {e}")))?;

        // Non-relocatable executables are loaded at their link-time addresses.
        if file.kind() != ObjectKind::Dynamic {
            return Ok(AddressNormalizer::Identity);
        }

        for segment in file.segments() {
            let (file_start, file_size) = segment.file_range();
            if let Some(file_vaddr) =
                segment_vaddr(file_start, file_size, segment.address(), mapping.offset)
            {
                return Ok(AddressNormalizer::Shift { runtime_start: mapping.start, file_vaddr });
            }
        }
        Ok(AddressNormalizer::Shift { runtime_start: mapping.start, file_vaddr: mapping.offset })
    }

    fn normalize(&self, address: u64) -> u64 {
        match *self {
            AddressNormalizer::Identity => address,
            AddressNormalizer::Shift { runtime_start, file_vaddr } => {
                address.wrapping_sub(runtime_start).wrapping_add(file_vaddr)
            }
        }
    }
}

/// Virtual address of file `offset` inside a segment, or `None` when the
/// offset falls outside it. Malformed segment headers never match.
fn segment_vaddr(file_start: u64, file_size: u64, vaddr: u64, offset: u64) -> Option<u64> {
    let file_end = file_start.checked_add(file_size)?;
    if offset < file_start || offset >= file_end {
        return None;
    }
    vaddr.checked_add(offset - file_start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offset_inside_segment_maps_to_its_vaddr() {
        assert_eq!(segment_vaddr(0x1000, 0x169, 0x1000, 0x1000), Some(0x1000));
        assert_eq!(segment_vaddr(0x2e00, 0x200, 0x3e00, 0x2f00), Some(0x3f00));
        assert_eq!(segment_vaddr(0x1000, 0x169, 0x1000, 0x1169), None);
        assert_eq!(segment_vaddr(0x1000, 0x169, 0x1000, 0xfff), None);
    }

    #[test]
    fn overflowing_segment_headers_are_skipped() {
        assert_eq!(segment_vaddr(u64::MAX - 1, 10, 0x1000, u64::MAX), None);
        assert_eq!(segment_vaddr(0, u64::MAX, u64::MAX - 4, 0x10), None);
        assert_eq!(segment_vaddr(u64::MAX - 1, 1, 0x1000, u64::MAX - 1), Some(0x1000));
    }
}
