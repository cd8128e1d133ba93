//! Static TLS block geometry for the two thread-pointer ABIs.
//!
//! Every offset handed out at startup is derived from one [`StaticLayout`] value, whose ranges are
//! relative to the aligned base of the block.

use core::ops::Range;

use super::{
    dtv::Dtv,
    registry::StaticTlsParams,
    segment::TlsSegment,
    tcb::{TcbHead, TcbHeader},
};
use crate::{config::TCB_ALIGNMENT, Result, TlsError};

/// A platform-reserved area inside the static block, such as the Linux rseq area.
pub trait ExtraTls {
    fn size(&self) -> usize;
    fn align(&self) -> usize;
    /// Receives the thread-pointer relative offset chosen for the area.
    fn set_offset(&mut self, offset: isize);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoExtraTls;

impl ExtraTls for NoExtraTls {
    fn size(&self) -> usize {
        0
    }
    fn align(&self) -> usize {
        0
    }
    fn set_offset(&mut self, _offset: isize) {}
}

impl<X: ExtraTls + ?Sized> ExtraTls for &mut X {
    fn size(&self) -> usize {
        (**self).size()
    }
    fn align(&self) -> usize {
        (**self).align()
    }
    fn set_offset(&mut self, offset: isize) {
        (**self).set_offset(offset)
    }
}

pub const RSEQ_AREA_SIZE: usize = 32;
pub const RSEQ_AREA_ALIGN: usize = 32;

/// Space for the kernel's restartable sequences area.
#[derive(Debug, Default, Clone, Copy)]
pub struct RseqArea {
    offset: Option<isize>,
}

impl RseqArea {
    pub const fn new() -> Self {
        Self { offset: None }
    }
    pub fn offset(&self) -> Option<isize> {
        self.offset
    }
}

impl ExtraTls for RseqArea {
    fn size(&self) -> usize {
        RSEQ_AREA_SIZE
    }
    fn align(&self) -> usize {
        RSEQ_AREA_ALIGN
    }
    fn set_offset(&mut self, offset: isize) {
        self.offset = Some(offset);
    }
}

/// Inputs of the static block computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutRequest {
    pub mem_size: usize,
    pub align: usize,
    pub surplus: usize,
    pub extra_size: usize,
    pub extra_align: usize,
}

impl LayoutRequest {
    pub fn new<X: ExtraTls + ?Sized>(segment: &TlsSegment, surplus: usize, extra: &X) -> Self {
        Self {
            mem_size: segment.mem_size,
            align: segment.align,
            surplus,
            extra_size: extra.size(),
            extra_align: extra.align(),
        }
    }

    fn validate(&self) -> Result<()> {
        for align in [self.align, self.extra_align] {
            if align > 1 && !align.is_power_of_two() {
                return Err(TlsError::InvalidAlignment(align));
            }
        }
        Ok(())
    }

    fn max_align(&self) -> usize {
        TCB_ALIGNMENT.max(self.align).max(self.extra_align)
    }

    fn blocks_align(&self) -> usize {
        self.align.max(self.extra_align).max(1)
    }
}

/// Geometry of the initial thread's static TLS block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticLayout {
    /// Bytes to request from the early allocator, including alignment slack.
    pub alloc_size: usize,
    /// Alignment the block base is rounded up to.
    pub max_align: usize,
    /// Offset of the thread pointer from the aligned base.
    pub tp_offset: usize,
    pub tcb: Range<usize>,
    pub primary: Range<usize>,
    pub extra: Range<usize>,
    pub surplus: Range<usize>,
    /// Module 1's static TLS offset, in the layout's own direction.
    pub module_offset: usize,
    /// Thread-pointer relative offset of the extra block.
    pub extra_tp_offset: isize,
    pub static_size: usize,
    pub static_used: usize,
    pub static_align: usize,
}

impl StaticLayout {
    pub fn thread_pointer(&self, base: usize) -> usize {
        base + self.tp_offset
    }

    /// Bytes used from the aligned base.
    pub fn span(&self) -> usize {
        [&self.tcb, &self.primary, &self.extra, &self.surplus]
            .iter()
            .map(|range| range.end)
            .max()
            .unwrap_or(0)
    }

    fn check_extra(&self, extra_align: usize) -> Result<()> {
        if self.extra.is_empty() {
            return Ok(());
        }
        let out_of_range = Err(TlsError::ExtraBlockOutOfRange {
            offset: self.extra_tp_offset,
        });
        let overlaps = |other: &Range<usize>| {
            !other.is_empty() && self.extra.start < other.end && other.start < self.extra.end
        };
        if self.extra.end + self.max_align > self.alloc_size
            || overlaps(&self.tcb)
            || overlaps(&self.primary)
        {
            return out_of_range;
        }
        if extra_align > 1 && self.extra_tp_offset.rem_euclid(extra_align as isize) != 0 {
            return out_of_range;
        }
        let placed = self.tp_offset as isize + self.extra_tp_offset;
        if placed != self.extra.start as isize {
            return out_of_range;
        }
        Ok(())
    }
}

/// One of the two ways an ABI places static TLS relative to the thread pointer.
pub trait TlsLayout: Copy + Default + Send + Sync + 'static {
    /// Size of the control block this layout keeps at the thread pointer.
    const TCB_SIZE: usize;

    fn compute(&self, req: &LayoutRequest) -> Result<StaticLayout>;

    /// Address of a static TLS block given its offset.
    fn static_address(&self, tp: usize, offset: usize) -> usize;

    /// The signed thread-pointer offset of a static TLS block.
    fn tp_relative(&self, offset: usize) -> isize;

    /// Carve `size` bytes aligned to `align` out of the unused static area.
    ///
    /// Returns the module's offset and the new `used` value.
    fn allocate_static(
        &self,
        params: &StaticTlsParams,
        size: usize,
        align: usize,
    ) -> Option<(usize, usize)>;

    /// Thread pointer of a fresh `params.size` byte block at `base`.
    fn block_thread_pointer(&self, base: usize, params: &StaticTlsParams) -> usize;

    unsafe fn write_control_block(&self, tp: usize, dtv: *mut Dtv);

    unsafe fn dtv(&self, tp: usize) -> *mut Dtv;
}

/// The `TLS_TCB_AT_TP` variant: static TLS below the thread pointer, control block at it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TcbAtTp;

/// The `TLS_DTV_AT_TP` variant: control block at the thread pointer, static TLS right after it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DtvAtTp;

#[cfg(any(target_arch = "x86", target_arch = "x86_64", target_arch = "s390x"))]
pub use self::TcbAtTp as NativeLayout;
#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "s390x")))]
pub use self::DtvAtTp as NativeLayout;

pub(crate) fn round_up(value: usize, align: usize) -> Result<usize> {
    let align = align.max(1);
    value
        .checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or(TlsError::Overflow)
}

fn add(a: usize, b: usize) -> Result<usize> {
    a.checked_add(b).ok_or(TlsError::Overflow)
}

fn to_isize(value: usize) -> Result<isize> {
    isize::try_from(value).map_err(|_| TlsError::Overflow)
}

impl TlsLayout for TcbAtTp {
    const TCB_SIZE: usize = core::mem::size_of::<TcbHeader>();

    fn compute(&self, req: &LayoutRequest) -> Result<StaticLayout> {
        req.validate()?;
        let max_align = req.max_align();

        let tls_blocks_size = add(round_up(req.mem_size, req.blocks_align())?, req.extra_size)?;
        let extra_tp_offset = -to_isize(tls_blocks_size)?;
        let tcb_offset = round_up(add(tls_blocks_size, req.surplus)?, max_align)?;
        let alloc_size = add(add(tcb_offset, Self::TCB_SIZE)?, max_align)?;
        let module_offset = round_up(req.mem_size, req.align)?;

        let static_align = max_align;
        let static_size = add(tcb_offset, round_up(Self::TCB_SIZE, static_align)?)?;

        let extra_start = tcb_offset - tls_blocks_size;
        let primary_start = tcb_offset - module_offset;
        let layout = StaticLayout {
            alloc_size,
            max_align,
            tp_offset: tcb_offset,
            tcb: tcb_offset..tcb_offset + Self::TCB_SIZE,
            primary: primary_start..primary_start + req.mem_size,
            extra: extra_start..extra_start + req.extra_size,
            surplus: 0..extra_start,
            module_offset,
            extra_tp_offset,
            static_size,
            static_used: tls_blocks_size,
            static_align,
        };
        layout.check_extra(req.extra_align)?;
        Ok(layout)
    }

    fn static_address(&self, tp: usize, offset: usize) -> usize {
        tp.wrapping_sub(offset)
    }

    fn tp_relative(&self, offset: usize) -> isize {
        (offset as isize).wrapping_neg()
    }

    fn allocate_static(
        &self,
        params: &StaticTlsParams,
        size: usize,
        align: usize,
    ) -> Option<(usize, usize)> {
        if align > params.align {
            return None;
        }
        let limit = params
            .size
            .checked_sub(round_up(Self::TCB_SIZE, params.align).ok()?)?;
        let offset = round_up(params.used.checked_add(size)?, align).ok()?;
        (offset <= limit).then_some((offset, offset))
    }

    fn block_thread_pointer(&self, base: usize, params: &StaticTlsParams) -> usize {
        let tcb = round_up(Self::TCB_SIZE, params.align).unwrap_or(Self::TCB_SIZE);
        base + params.size - tcb
    }

    unsafe fn write_control_block(&self, tp: usize, dtv: *mut Dtv) {
        let tcb = tp as *mut TcbHeader;
        tcb.write(TcbHeader {
            tcb,
            dtv,
            self_ptr: tcb,
        });
    }

    unsafe fn dtv(&self, tp: usize) -> *mut Dtv {
        (*(tp as *const TcbHeader)).dtv
    }
}

impl TlsLayout for DtvAtTp {
    const TCB_SIZE: usize = core::mem::size_of::<TcbHead>();

    fn compute(&self, req: &LayoutRequest) -> Result<StaticLayout> {
        req.validate()?;
        let max_align = req.max_align();

        let tcb_offset = round_up(Self::TCB_SIZE, req.align)?;
        // Rounded from the primary block's end, which lies past TCB_SIZE + mem_size when the
        // module alignment exceeds the control block size.
        let tls_blocks_size = add(
            round_up(add(tcb_offset, req.mem_size)?, req.blocks_align())?,
            req.extra_size,
        )?;
        let extra_start = tls_blocks_size - req.extra_size;

        let static_align = max_align;
        let static_size = round_up(add(tls_blocks_size, req.surplus)?, static_align)?;
        // Late static allocations may use everything up to `static_size`.
        let alloc_size = add(static_size, max_align)?;

        let layout = StaticLayout {
            alloc_size,
            max_align,
            tp_offset: 0,
            tcb: 0..Self::TCB_SIZE,
            primary: tcb_offset..tcb_offset + req.mem_size,
            extra: extra_start..tls_blocks_size,
            surplus: tls_blocks_size..tls_blocks_size + req.surplus,
            module_offset: tcb_offset,
            extra_tp_offset: to_isize(extra_start)?,
            static_size,
            static_used: tls_blocks_size,
            static_align,
        };
        layout.check_extra(req.extra_align)?;
        Ok(layout)
    }

    fn static_address(&self, tp: usize, offset: usize) -> usize {
        tp.wrapping_add(offset)
    }

    fn tp_relative(&self, offset: usize) -> isize {
        offset as isize
    }

    fn allocate_static(
        &self,
        params: &StaticTlsParams,
        size: usize,
        align: usize,
    ) -> Option<(usize, usize)> {
        if align > params.align {
            return None;
        }
        let offset = round_up(params.used, align).ok()?;
        let end = offset.checked_add(size)?;
        (end <= params.size).then_some((offset, end))
    }

    fn block_thread_pointer(&self, base: usize, _params: &StaticTlsParams) -> usize {
        base
    }

    unsafe fn write_control_block(&self, tp: usize, dtv: *mut Dtv) {
        (tp as *mut TcbHead).write(TcbHead {
            dtv,
            private: core::ptr::null_mut(),
        });
    }

    unsafe fn dtv(&self, tp: usize) -> *mut Dtv {
        (*(tp as *const TcbHead)).dtv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mem_size: usize, align: usize, surplus: usize) -> LayoutRequest {
        LayoutRequest {
            mem_size,
            align,
            surplus,
            extra_size: 0,
            extra_align: 0,
        }
    }

    fn check_invariants<L: TlsLayout>(layout: &L, req: &LayoutRequest, above_tp: bool) {
        let computed = layout.compute(req).unwrap();
        assert_eq!(computed.static_size % TCB_ALIGNMENT, 0, "{req:?}");
        assert_eq!(computed.static_size % req.align.max(1), 0, "{req:?}");
        assert!(computed.span() + computed.max_align <= computed.alloc_size);
        if above_tp {
            // Late static allocations can reach the end of the static size.
            assert!(computed.static_size + computed.max_align <= computed.alloc_size);
        }
        assert!(computed.static_used <= computed.static_size);
        assert_eq!(computed.primary.len(), req.mem_size);

        let tp = computed.thread_pointer(0x10_0000);
        let primary = layout.static_address(tp, computed.module_offset);
        assert_eq!(primary, 0x10_0000 + computed.primary.start);
        assert_eq!(primary % req.align.max(1), 0, "{req:?}");
        assert!(computed.primary.end <= computed.tcb.start || computed.primary.start >= computed.tcb.end);
    }

    #[test]
    fn invariants_hold_over_sizes_and_alignments() {
        for mem_size in [0, 1, 8, 24, 100, 4096] {
            for align in [0, 1, 8, 16, 64, 256] {
                for surplus in [0, 1520] {
                    let req = request(mem_size, align, surplus);
                    check_invariants(&TcbAtTp, &req, false);
                    check_invariants(&DtvAtTp, &req, true);
                }
            }
        }
    }

    #[test]
    fn dtv_at_tp_basic() {
        let layout = DtvAtTp.compute(&request(64, 16, 0)).unwrap();
        assert_eq!(DtvAtTp::TCB_SIZE, 16);
        assert_eq!(layout.module_offset, 16);
        assert_eq!(layout.primary, 16..80);
        assert_eq!(layout.static_used, 80);
        assert!(layout.static_size >= 80);
        assert_eq!(layout.static_size % 64, 0);
        assert_eq!(DtvAtTp.static_address(0x1000, layout.module_offset), 0x1010);
    }

    #[test]
    fn tcb_at_tp_basic() {
        let layout = TcbAtTp.compute(&request(64, 16, 0)).unwrap();
        assert_eq!(TcbAtTp::TCB_SIZE, 64);
        assert_eq!(layout.module_offset, 64);
        assert_eq!(layout.tp_offset, 64);
        assert_eq!(layout.primary, 0..64);
        assert_eq!(layout.tcb, 64..128);
        assert_eq!(layout.alloc_size, 64 + 64 + 64);
        assert_eq!(TcbAtTp.tp_relative(layout.module_offset), -64);
    }

    #[test]
    fn no_tls_and_no_surplus_below_tp() {
        let computed = TcbAtTp.compute(&request(0, 256, 0)).unwrap();
        assert_eq!(computed.tp_offset, 0);
        assert_eq!(computed.static_size, 256);
        assert!(computed.span() + computed.max_align <= computed.alloc_size);
    }

    #[test]
    fn native_layout_is_usable_as_a_value() {
        let layout = NativeLayout;
        let computed = layout.compute(&request(24, 8, 0)).unwrap();
        let tp = computed.thread_pointer(0x8000);
        assert_eq!(
            layout.static_address(tp, computed.module_offset),
            0x8000 + computed.primary.start
        );
        assert_eq!(NativeLayout::default(), layout);
    }

    #[test]
    fn empty_segment_keeps_surplus() {
        for computed in [
            TcbAtTp.compute(&request(0, 0, 1520)).unwrap(),
            DtvAtTp.compute(&request(0, 0, 1520)).unwrap(),
        ] {
            assert!(computed.primary.is_empty());
            // Below the thread pointer the surplus also takes the alignment padding.
            assert!(computed.surplus.len() >= 1520);
            assert!(computed.static_size >= 1520);
        }
    }

    #[test]
    fn extra_block_placement() {
        let mut rseq = RseqArea::new();
        let req = LayoutRequest {
            mem_size: 40,
            align: 8,
            surplus: 256,
            extra_size: rseq.size(),
            extra_align: rseq.align(),
        };

        let a = TcbAtTp.compute(&req).unwrap();
        assert_eq!(a.extra_tp_offset, -(64 + 32));
        assert_eq!(a.extra.len(), 32);
        assert!(a.extra.end <= a.primary.start);
        rseq.set_offset(a.extra_tp_offset);
        assert_eq!(rseq.offset(), Some(-96));

        let b = DtvAtTp.compute(&req).unwrap();
        assert_eq!(b.extra_tp_offset, 64);
        assert!(b.extra.start >= b.primary.end);
        assert_eq!(b.extra_tp_offset % 32, 0);
    }

    #[test]
    fn rejects_bad_alignment() {
        assert_eq!(
            TcbAtTp.compute(&request(8, 12, 0)),
            Err(TlsError::InvalidAlignment(12))
        );
        let req = LayoutRequest {
            extra_size: 8,
            extra_align: 3,
            ..request(8, 8, 0)
        };
        assert_eq!(DtvAtTp.compute(&req), Err(TlsError::InvalidAlignment(3)));
    }

    #[test]
    fn extra_size_must_keep_alignment() {
        let req = LayoutRequest {
            extra_size: 20,
            extra_align: 16,
            ..request(8, 8, 0)
        };
        assert!(matches!(
            TcbAtTp.compute(&req),
            Err(TlsError::ExtraBlockOutOfRange { .. })
        ));
    }

    #[test]
    fn overflow_is_reported() {
        assert_eq!(
            TcbAtTp.compute(&request(usize::MAX - 8, 16, 0)),
            Err(TlsError::Overflow)
        );
        assert_eq!(
            DtvAtTp.compute(&request(16, 16, usize::MAX)),
            Err(TlsError::Overflow)
        );
    }

    fn params(size: usize, used: usize, align: usize) -> StaticTlsParams {
        StaticTlsParams {
            size,
            used,
            align,
            ..StaticTlsParams::default()
        }
    }

    #[test]
    fn late_static_allocation() {
        // 128 bytes used, 64 byte control block reserved at the top.
        let p = params(512, 128, 64);
        assert_eq!(TcbAtTp.allocate_static(&p, 100, 16), Some((240, 240)));
        assert_eq!(TcbAtTp.allocate_static(&p, 400, 16), None);
        assert_eq!(TcbAtTp.allocate_static(&p, 8, 128), None);

        assert_eq!(DtvAtTp.allocate_static(&p, 100, 16), Some((128, 228)));
        assert_eq!(DtvAtTp.allocate_static(&p, 385, 16), None);
    }

    #[test]
    fn thread_blocks_reuse_initial_geometry() {
        let computed = TcbAtTp.compute(&request(40, 8, 1520)).unwrap();
        let p = params(computed.static_size, computed.static_used, computed.static_align);
        assert_eq!(
            TcbAtTp.block_thread_pointer(0x4000, &p),
            computed.thread_pointer(0x4000)
        );
        let computed = DtvAtTp.compute(&request(40, 8, 1520)).unwrap();
        assert_eq!(DtvAtTp.block_thread_pointer(0x4000, &p), 0x4000);
        assert_eq!(computed.thread_pointer(0x4000), 0x4000);
    }
}
