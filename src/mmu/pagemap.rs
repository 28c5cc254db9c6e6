#![allow(clippy::cast_possible_truncation)]

use super::pin::{HostPinner, PinnedPages};
use crate::error::MmuResult;
use crate::utils::{PAGE_SHIFT, PAGE_SIZE};
use std::fs::{self, File};
use std::os::unix::fs::FileExt;

const PM_PRESENT: u64 = 1 << 63;
const PM_PFN_MASK: u64 = (1 << 55) - 1;

/// Frame number from a `/proc/<pid>/pagemap` entry, if the page is resident.
///
/// Without `CAP_SYS_ADMIN` the kernel reports a zero frame number, which counts as
/// unresolved.
#[must_use]
pub const fn pagemap_pfn(entry: u64) -> Option<u64> {
    let pfn = entry & PM_PFN_MASK;
    if entry & PM_PRESENT == 0 || pfn == 0 { None } else { Some(pfn) }
}

/// `KernelPageSize` in KiB of the mapping containing `vaddr`, parsed from smaps text.
#[must_use]
pub fn smaps_kernel_page_kb(smaps: &str, vaddr: u64) -> Option<u64> {
    let mut inside = false;
    for line in smaps.lines() {
        if let Some((range, _)) = line.split_once(' ')
            && let Some((lo, hi)) = range.split_once('-')
            && let (Ok(lo), Ok(hi)) = (u64::from_str_radix(lo, 16), u64::from_str_radix(hi, 16))
        {
            inside = vaddr >= lo && vaddr < hi;
            continue;
        }
        if inside && let Some(rest) = line.strip_prefix("KernelPageSize:") {
            return rest.trim().trim_end_matches("kB").trim().parse().ok();
        }
    }
    None
}

/// Pins pages of the calling process with `mlock` and resolves their frames through
/// `/proc/self/pagemap`.
///
/// Requests for other processes obtain no pages.
#[derive(Debug, Default)]
pub struct MlockPinner;

impl MlockPinner {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn own(pid: u32) -> bool {
        pid == std::process::id()
    }

    fn munlock(vpn: u64, n_pages: u64) {
        if n_pages == 0 {
            return;
        }
        let ret = unsafe {
            libc::munlock(
                (vpn << PAGE_SHIFT) as *const libc::c_void,
                (n_pages * PAGE_SIZE) as usize,
            )
        };
        if ret != 0 {
            log::warn!(
                "munlock [0x{:x}, +{n_pages}) failed: {}",
                vpn << PAGE_SHIFT,
                std::io::Error::last_os_error()
            );
        }
    }

    fn resolve(vpn: u64, n_pages: u64) -> MmuResult<Vec<u64>> {
        let pagemap = File::open("/proc/self/pagemap")?;
        let mut raw = vec![0u8; n_pages as usize * 8];
        pagemap.read_exact_at(&mut raw, vpn * 8)?;

        Ok(raw
            .chunks_exact(8)
            .map(|c| u64::from_ne_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .map_while(pagemap_pfn)
            .map(|pfn| pfn << PAGE_SHIFT)
            .collect())
    }
}

impl HostPinner for MlockPinner {
    fn is_huge_backed(&self, pid: u32, vaddr: u64) -> bool {
        let path = format!("/proc/{pid}/smaps");
        match fs::read_to_string(&path) {
            Ok(text) => smaps_kernel_page_kb(&text, vaddr).is_some_and(|kb| kb << 10 > PAGE_SIZE),
            Err(e) => {
                log::debug!("{path}: {e}");
                false
            }
        }
    }

    fn pin(&self, pid: u32, vpn: u64, n_pages: u64) -> MmuResult<PinnedPages> {
        if !Self::own(pid) {
            log::warn!("mlock pinner: hpid {pid} is not this process");
            return Ok(PinnedPages::default());
        }

        let ret = unsafe {
            libc::mlock(
                (vpn << PAGE_SHIFT) as *const libc::c_void,
                (n_pages * PAGE_SIZE) as usize,
            )
        };
        if ret != 0 {
            log::warn!("mlock failed: {}", std::io::Error::last_os_error());
            return Ok(PinnedPages::default());
        }

        let phys = match Self::resolve(vpn, n_pages) {
            Ok(p) => p,
            Err(e) => {
                Self::munlock(vpn, n_pages);
                return Err(e);
            }
        };
        let got = phys.len() as u64;
        Self::munlock(vpn + got, n_pages - got);

        Ok(PinnedPages {
            phys,
            needs_explicit_sync: false,
        })
    }

    fn unpin(&self, pid: u32, vpn: u64, phys: &[u64], dirty: bool) {
        if !Self::own(pid) {
            return;
        }
        log::trace!("munlock [0x{vpn:x}, +{}) dirty {dirty}", phys.len());
        Self::munlock(vpn, phys.len() as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SMAPS: &str = "\
00400000-00452000 r-xp 00000000 08:02 173521      /usr/bin/dbus-daemon
Size:                328 kB
KernelPageSize:        4 kB
MMUPageSize:           4 kB
7f0000000000-7f0000400000 rw-s 00000000 00:0f 1234    /dev/hugepages/buf
Size:               4096 kB
KernelPageSize:     2048 kB
MMUPageSize:        2048 kB
";

    #[test]
    fn finds_kernel_page_size() {
        assert_eq!(smaps_kernel_page_kb(SMAPS, 0x40_1000), Some(4));
        assert_eq!(smaps_kernel_page_kb(SMAPS, 0x7f00_0020_0000), Some(2048));
        assert_eq!(smaps_kernel_page_kb(SMAPS, 0x1000), None);
    }

    #[test]
    fn decodes_pagemap_entries() {
        assert_eq!(pagemap_pfn(PM_PRESENT | 0x1234), Some(0x1234));
        assert_eq!(pagemap_pfn(0x1234), None);
        assert_eq!(pagemap_pfn(PM_PRESENT), None);
    }

    #[test]
    fn foreign_process_gets_nothing() {
        let p = MlockPinner::new();
        let pages = p.pin(std::process::id().wrapping_add(1), 0x10, 2).unwrap();
        assert!(pages.phys.is_empty());
    }
}
