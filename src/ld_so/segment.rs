//! Discovery of the executable's `PT_TLS` segment.

use core::{mem, slice};

use object::{elf, read::elf::ProgramHeader as _, NativeEndian};

use crate::{Result, TlsError};

#[cfg(target_pointer_width = "64")]
pub type ProgramHeader = elf::ProgramHeader64<NativeEndian>;
#[cfg(target_pointer_width = "32")]
pub type ProgramHeader = elf::ProgramHeader32<NativeEndian>;

pub const AT_NULL: usize = 0;
pub const AT_PHDR: usize = 3;
pub const AT_PHENT: usize = 4;
pub const AT_PHNUM: usize = 5;

/// The TLS template of the primary executable.
///
/// Bytes `[0, file_size)` of every thread's block come from `image`, `[file_size, mem_size)` are
/// zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsSegment {
    pub mem_size: usize,
    pub file_size: usize,
    pub image: *const u8,
    pub align: usize,
}

// The image is read-only load data that lives for the whole process.
unsafe impl Send for TlsSegment {}
unsafe impl Sync for TlsSegment {}

impl TlsSegment {
    /// An executable without TLS.
    pub const EMPTY: Self = Self {
        mem_size: 0,
        file_size: 0,
        image: core::ptr::null(),
        align: 0,
    };

    /// Return the first `PT_TLS` entry of `phdrs`, relocated by `load_bias`, or [`Self::EMPTY`].
    pub fn scan(phdrs: &[ProgramHeader], load_bias: usize) -> Result<Self> {
        let endian = NativeEndian;
        let Some(ph) = phdrs.iter().find(|ph| ph.p_type(endian) == elf::PT_TLS) else {
            return Ok(Self::EMPTY);
        };

        let mem_size = ph.p_memsz(endian) as usize;
        let file_size = ph.p_filesz(endian) as usize;
        let align = ph.p_align(endian) as usize;
        if file_size > mem_size {
            return Err(TlsError::MalformedSegment {
                file_size,
                mem_size,
            });
        }
        if align > 1 && !align.is_power_of_two() {
            return Err(TlsError::InvalidAlignment(align));
        }

        Ok(Self {
            mem_size,
            file_size,
            image: (ph.p_vaddr(endian) as usize).wrapping_add(load_bias) as *const u8,
            align,
        })
    }

    /// Find the program headers through the auxiliary vector and scan them.
    ///
    /// The load bias is derived from `PT_PHDR` when present, so static PIE executables work.
    pub unsafe fn from_auxv(auxv: *const (usize, usize)) -> Result<Self> {
        let mut phdr_opt = None;
        let mut phent_opt = None;
        let mut phnum_opt = None;

        let mut auxv = auxv;
        loop {
            let (kind, value) = *auxv;
            match kind {
                AT_NULL => break,
                AT_PHDR => phdr_opt = Some(value),
                AT_PHENT => phent_opt = Some(value),
                AT_PHNUM => phnum_opt = Some(value),
                _ => (),
            }
            auxv = auxv.add(1);
        }

        let phdr = phdr_opt.ok_or(TlsError::MissingAuxv("AT_PHDR"))?;
        let phent = phent_opt.ok_or(TlsError::MissingAuxv("AT_PHENT"))?;
        let phnum = phnum_opt.ok_or(TlsError::MissingAuxv("AT_PHNUM"))?;
        if phent != mem::size_of::<ProgramHeader>() {
            return Err(TlsError::UnsupportedPhent(phent));
        }

        let phdrs = slice::from_raw_parts(phdr as *const ProgramHeader, phnum);
        let load_bias = phdrs
            .iter()
            .find(|ph| ph.p_type(NativeEndian) == elf::PT_PHDR)
            .map_or(0, |ph| phdr.wrapping_sub(ph.p_vaddr(NativeEndian) as usize));
        Self::scan(phdrs, load_bias)
    }

    pub fn is_empty(&self) -> bool {
        self.mem_size == 0
    }

    /// The initialized part of the template.
    pub unsafe fn image(&self) -> &'static [u8] {
        if self.file_size == 0 {
            return &[];
        }
        slice::from_raw_parts(self.image, self.file_size)
    }
}

#[cfg(all(test, target_pointer_width = "64"))]
mod tests {
    use super::*;
    use alloc::vec;
    use object::endian::{U32, U64};

    fn phdr(p_type: u32, vaddr: u64, filesz: u64, memsz: u64, align: u64) -> ProgramHeader {
        let e = NativeEndian;
        ProgramHeader {
            p_type: U32::new(e, p_type),
            p_flags: U32::new(e, elf::PF_R),
            p_offset: U64::new(e, vaddr),
            p_vaddr: U64::new(e, vaddr),
            p_paddr: U64::new(e, vaddr),
            p_filesz: U64::new(e, filesz),
            p_memsz: U64::new(e, memsz),
            p_align: U64::new(e, align),
        }
    }

    #[test]
    fn no_tls_segment() {
        let phdrs = [phdr(elf::PT_LOAD, 0, 0x1000, 0x1000, 0x1000)];
        assert_eq!(TlsSegment::scan(&phdrs, 0).unwrap(), TlsSegment::EMPTY);
        assert!(TlsSegment::EMPTY.is_empty());
    }

    #[test]
    fn finds_first_tls_segment() {
        let phdrs = [
            phdr(elf::PT_LOAD, 0, 0x1000, 0x1000, 0x1000),
            phdr(elf::PT_TLS, 0x2000, 0x10, 0x40, 16),
            phdr(elf::PT_TLS, 0x3000, 0x8, 0x8, 8),
        ];
        let segment = TlsSegment::scan(&phdrs, 0x10_0000).unwrap();
        assert_eq!(
            segment,
            TlsSegment {
                mem_size: 0x40,
                file_size: 0x10,
                image: 0x10_2000 as *const u8,
                align: 16,
            }
        );
    }

    #[test]
    fn rejects_bad_segments() {
        let phdrs = [phdr(elf::PT_TLS, 0x2000, 0x20, 0x10, 8)];
        assert_eq!(
            TlsSegment::scan(&phdrs, 0),
            Err(TlsError::MalformedSegment {
                file_size: 0x20,
                mem_size: 0x10
            })
        );
        let phdrs = [phdr(elf::PT_TLS, 0x2000, 0x10, 0x10, 24)];
        assert_eq!(
            TlsSegment::scan(&phdrs, 0),
            Err(TlsError::InvalidAlignment(24))
        );
    }

    #[test]
    fn from_auxv_applies_load_bias() {
        static IMAGE: [u8; 4] = [1, 2, 3, 4];

        let mut phdrs = vec![
            phdr(elf::PT_PHDR, 0x40, 0, 0, 8),
            phdr(elf::PT_LOAD, 0, 0x1000, 0x1000, 0x1000),
            phdr(elf::PT_TLS, 0, 4, 16, 8),
        ];
        let table = phdrs.as_ptr() as usize;
        let bias = table - 0x40;
        let tls_vaddr = (IMAGE.as_ptr() as usize).wrapping_sub(bias) as u64;
        phdrs[2] = phdr(elf::PT_TLS, tls_vaddr, 4, 16, 8);

        let auxv = [
            (6, 4096),
            (AT_PHDR, table),
            (AT_PHENT, mem::size_of::<ProgramHeader>()),
            (AT_PHNUM, phdrs.len()),
            (AT_NULL, 0),
        ];
        let segment = unsafe { TlsSegment::from_auxv(auxv.as_ptr()) }.unwrap();
        assert_eq!(segment.mem_size, 16);
        assert_eq!(unsafe { segment.image() }, &IMAGE);
    }

    #[test]
    fn from_auxv_requires_phdrs() {
        let auxv = [(AT_PHENT, 56), (AT_NULL, 0)];
        assert_eq!(
            unsafe { TlsSegment::from_auxv(auxv.as_ptr()) },
            Err(TlsError::MissingAuxv("AT_PHDR"))
        );
    }
}
