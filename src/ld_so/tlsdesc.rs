//! TLS descriptor calling convention (x86_64 reference).
//!
//! A descriptor is a pair `{ entry, arg }`. Generated code loads the descriptor address into
//! `rax`, calls `entry`, and adds the returned value to the thread pointer. Entries preserve
//! every register except `rax` and the flags, including vector and x87 state.

use core::mem;

use generic_rt::ExpectTlsFree;
use spin::Once;
use static_assertions::{assert_eq_size, const_assert_eq};

use super::{
    layout::{NativeLayout, TlsLayout},
    registry::Registry,
    resolve::{Resolver, TlsDescDynamicArg, TlsIndex},
};

static CONTEXT: Once<&'static Registry> = Once::new();

/// Make `registry` the one the ABI entry points resolve against. Only the first call has effect.
pub fn install_context(registry: &'static Registry) -> &'static Registry {
    CONTEXT.call_once(|| {
        #[cfg(all(target_arch = "x86_64", target_os = "linux"))]
        x86_64::publish(registry);
        registry
    })
}

pub fn context() -> Option<&'static Registry> {
    CONTEXT.get().copied()
}

assert_eq_size!(TlsIndex, [usize; 2]);
assert_eq_size!(TlsDescDynamicArg, [usize; 3]);
const_assert_eq!(mem::offset_of!(TlsDescDynamicArg, gen_count), 2 * mem::size_of::<usize>());

unsafe fn current_dtv_and_tp() -> (&'static mut super::dtv::Dtv, usize) {
    let tp = generic_rt::thread_pointer();
    let dtv = NativeLayout
        .dtv(tp)
        .as_mut()
        .expect_notls("thread has no DTV installed");
    (dtv, tp)
}

/// Slow path of `_tlsboot_tlsdesc_dynamic`. Returns the thread-pointer relative address.
#[cfg_attr(not(all(target_arch = "x86_64", target_os = "linux")), allow(dead_code))]
unsafe extern "C" fn tlsdesc_dynamic_slow(arg: *const TlsDescDynamicArg) -> isize {
    let registry = context().expect_notls("dynamic TLS descriptor used before TLS setup");
    let (dtv, tp) = current_dtv_and_tp();
    let addr = Resolver::new(registry, NativeLayout)
        .resolve_dynamic(dtv, tp, &*arg)
        .expect_notls("failed to resolve dynamic TLS descriptor");
    (addr as isize).wrapping_sub(tp as isize)
}

/// `__tls_get_addr` for the calling thread.
#[export_name = "tlsboot_tls_get_addr"]
pub unsafe extern "C" fn tls_get_addr(index: *const TlsIndex) -> *mut u8 {
    let registry = context().expect_notls("TLS lookup before TLS setup");
    let (dtv, tp) = current_dtv_and_tp();
    Resolver::new(registry, NativeLayout)
        .tls_get_addr(dtv, tp, &*index)
        .expect_notls("failed to resolve TLS address")
}

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
pub use self::x86_64::*;

#[cfg(all(target_arch = "x86_64", target_os = "linux"))]
mod x86_64 {
    use core::{
        mem,
        sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
    };

    use static_assertions::const_assert_eq;

    use super::tlsdesc_dynamic_slow;
    use crate::ld_so::{
        registry::Registry,
        resolve::{TlsDescDynamicArg, TlsDescriptor},
    };

    /// Bytes `xsave` needs for the enabled state components, 0 to fall back to `fxsave`.
    static XSAVE_STATE_SIZE: AtomicUsize = AtomicUsize::new(0);
    /// The registry generation counter the fast path compares against. Null means always slow.
    static GENERATION: AtomicPtr<AtomicUsize> = AtomicPtr::new(core::ptr::null_mut());

    /// Legacy region plus the xsave header.
    const XSAVE_MIN_SIZE: usize = 576;

    pub(super) fn publish(registry: &'static Registry) {
        XSAVE_STATE_SIZE.store(xsave_state_size(), Ordering::Relaxed);
        GENERATION.store(
            registry.generation_counter() as *const AtomicUsize as *mut AtomicUsize,
            Ordering::Release,
        );
    }

    fn xsave_state_size() -> usize {
        use core::arch::x86_64::{__cpuid, __cpuid_count};

        // OSXSAVE: the kernel enabled xsave and set XCR0.
        #[allow(unused_unsafe)]
        let features = unsafe { __cpuid(1) };
        if features.ecx & (1 << 27) == 0 {
            return 0;
        }
        #[allow(unused_unsafe)]
        let size = unsafe { __cpuid_count(0xd, 0) }.ebx as usize;
        if size < XSAVE_MIN_SIZE {
            0
        } else {
            size
        }
    }

    extern "C" {
        // Not callable from Rust: they take the descriptor in `rax`.
        pub fn _tlsboot_tlsdesc_return();
        pub fn _tlsboot_tlsdesc_undefweak();
        pub fn _tlsboot_tlsdesc_dynamic();
    }

    // `_tlsboot_tlsdesc_dynamic` answers from the DTV when the descriptor and the DTV are both
    // at the current generation and the module block exists. Otherwise it saves the caller's
    // scratch registers and extended state and calls `tlsdesc_dynamic_slow`.
    //
    // DTV access: fs:[8] is `TcbHeader::dtv`, its first word is `Dtv::slots`. Slot 0 holds the
    // capacity, slot 1 the generation, module `m` the pointer at byte `16 * (m + 1)`.
    core::arch::global_asm!(
    "    .pushsection .text._tlsboot_tlsdesc,\"ax\",@progbits",
    "",
    "    .p2align 4",
    "    .globl _tlsboot_tlsdesc_return",
    "    .hidden _tlsboot_tlsdesc_return",
    "    .type _tlsboot_tlsdesc_return,@function",
    "_tlsboot_tlsdesc_return:",
    "    mov rax, qword ptr [rax + 8]",
    "    ret",
    "    .size _tlsboot_tlsdesc_return, . - _tlsboot_tlsdesc_return",
    "",
    "    .p2align 4",
    "    .globl _tlsboot_tlsdesc_undefweak",
    "    .hidden _tlsboot_tlsdesc_undefweak",
    "    .type _tlsboot_tlsdesc_undefweak,@function",
    "_tlsboot_tlsdesc_undefweak:",
    "    mov rax, qword ptr [rax + 8]",
    "    sub rax, qword ptr fs:[0]",
    "    ret",
    "    .size _tlsboot_tlsdesc_undefweak, . - _tlsboot_tlsdesc_undefweak",
    "",
    "    .p2align 4",
    "    .globl _tlsboot_tlsdesc_dynamic",
    "    .hidden _tlsboot_tlsdesc_dynamic",
    "    .type _tlsboot_tlsdesc_dynamic,@function",
    "_tlsboot_tlsdesc_dynamic:",
    "    push rdi",
    "    push rsi",
    "    mov rsi, qword ptr [rax + 8]",
    "    mov rax, qword ptr [rip + {generation}@GOTPCREL]",
    "    mov rax, qword ptr [rax]",
    "    test rax, rax",
    "    jz .Ltlsdesc_slow",
    "    mov rax, qword ptr [rax]",
    "    cmp rax, qword ptr [rsi + 16]",
    "    jne .Ltlsdesc_slow",
    "    mov rdi, qword ptr fs:[8]",
    "    test rdi, rdi",
    "    jz .Ltlsdesc_slow",
    "    mov rdi, qword ptr [rdi]",
    "    cmp rax, qword ptr [rdi + 16]",
    "    jne .Ltlsdesc_slow",
    "    mov rax, qword ptr [rsi]",
    "    test rax, rax",
    "    jz .Ltlsdesc_slow",
    "    cmp rax, qword ptr [rdi]",
    "    ja .Ltlsdesc_slow",
    "    shl rax, 4",
    "    mov rax, qword ptr [rdi + rax + 16]",
    "    cmp rax, -1",
    "    je .Ltlsdesc_slow",
    "    add rax, qword ptr [rsi + 8]",
    "    sub rax, qword ptr fs:[0]",
    "    pop rsi",
    "    pop rdi",
    "    ret",
    "",
    ".Ltlsdesc_slow:",
    "    push rbp",
    "    mov rbp, rsp",
    "    push rdx",
    "    push rcx",
    "    push r8",
    "    push r9",
    "    push r10",
    "    push r11",
    "    mov rax, qword ptr [rip + {xsave_size}@GOTPCREL]",
    "    mov rax, qword ptr [rax]",
    "    test rax, rax",
    "    jz .Ltlsdesc_fxsave",
    "    sub rsp, rax",
    "    and rsp, -64",
    "    xor ecx, ecx",
    "    mov qword ptr [rsp + 512], rcx",
    "    mov qword ptr [rsp + 520], rcx",
    "    mov qword ptr [rsp + 528], rcx",
    "    mov qword ptr [rsp + 536], rcx",
    "    mov qword ptr [rsp + 544], rcx",
    "    mov qword ptr [rsp + 552], rcx",
    "    mov qword ptr [rsp + 560], rcx",
    "    mov qword ptr [rsp + 568], rcx",
    "    mov eax, -1",
    "    mov edx, -1",
    "    xsave64 [rsp]",
    "    mov rdi, rsi",
    "    call {slow}",
    "    mov rcx, rax",
    "    mov eax, -1",
    "    mov edx, -1",
    "    xrstor64 [rsp]",
    "    mov rax, rcx",
    "    jmp .Ltlsdesc_restore",
    "",
    ".Ltlsdesc_fxsave:",
    "    sub rsp, 512",
    "    and rsp, -16",
    "    fxsave64 [rsp]",
    "    mov rdi, rsi",
    "    call {slow}",
    "    fxrstor64 [rsp]",
    "",
    ".Ltlsdesc_restore:",
    "    lea rsp, [rbp - 48]",
    "    pop r11",
    "    pop r10",
    "    pop r9",
    "    pop r8",
    "    pop rcx",
    "    pop rdx",
    "    pop rbp",
    "    pop rsi",
    "    pop rdi",
    "    ret",
    "    .size _tlsboot_tlsdesc_dynamic, . - _tlsboot_tlsdesc_dynamic",
    "",
    "    .popsection",
        slow = sym tlsdesc_dynamic_slow,
        generation = sym GENERATION,
        xsave_size = sym XSAVE_STATE_SIZE,
    );

    #[repr(C)]
    #[derive(Debug, Clone, Copy)]
    pub struct TlsDesc {
        pub entry: unsafe extern "C" fn(),
        pub arg: usize,
    }

    const_assert_eq!(mem::size_of::<TlsDesc>(), 2 * mem::size_of::<usize>());

    impl TlsDesc {
        /// A variable at a fixed thread-pointer relative offset.
        pub fn new_static(tp_offset: isize) -> Self {
            Self {
                entry: _tlsboot_tlsdesc_return,
                arg: tp_offset as usize,
            }
        }

        /// An undefined weak TLS symbol, which resolves to `addend` (null for addend 0).
        pub fn new_undefweak(addend: usize) -> Self {
            Self {
                entry: _tlsboot_tlsdesc_undefweak,
                arg: addend,
            }
        }

        pub fn new_dynamic(arg: &'static TlsDescDynamicArg) -> Self {
            Self {
                entry: _tlsboot_tlsdesc_dynamic,
                arg: arg as *const TlsDescDynamicArg as usize,
            }
        }

        /// Decode the descriptor. `arg` of a dynamic one must still be alive.
        pub unsafe fn kind(&self) -> Option<TlsDescriptor<'_>> {
            let entry = self.entry as *const ();
            if entry == _tlsboot_tlsdesc_return as *const () {
                Some(TlsDescriptor::Static(self.arg as isize))
            } else if entry == _tlsboot_tlsdesc_undefweak as *const () {
                Some(TlsDescriptor::UndefWeak(self.arg))
            } else if entry == _tlsboot_tlsdesc_dynamic as *const () {
                (self.arg as *const TlsDescDynamicArg)
                    .as_ref()
                    .map(TlsDescriptor::Dynamic)
            } else {
                None
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use alloc::boxed::Box;

        /// Call a descriptor the way compiled code does and add the thread pointer.
        unsafe fn call(desc: &TlsDesc) -> usize {
            let offset: usize;
            core::arch::asm!(
                "call qword ptr [rax]",
                inout("rax") desc as *const TlsDesc => offset,
                clobber_abi("C"),
            );
            offset.wrapping_add(generic_rt::thread_pointer())
        }

        #[test]
        fn static_entry_returns_offset() {
            let desc = TlsDesc::new_static(-0x80);
            let tp = unsafe { generic_rt::thread_pointer() };
            assert_eq!(unsafe { call(&desc) }, tp.wrapping_sub(0x80));
            assert!(matches!(
                unsafe { desc.kind() },
                Some(TlsDescriptor::Static(-0x80))
            ));
        }

        #[test]
        fn undefweak_entry_resolves_to_addend() {
            assert_eq!(unsafe { call(&TlsDesc::new_undefweak(0)) }, 0);
            assert_eq!(unsafe { call(&TlsDesc::new_undefweak(0x40)) }, 0x40);
        }

        #[test]
        fn dynamic_kind() {
            let arg: &'static TlsDescDynamicArg =
                Box::leak(Box::new(TlsDescDynamicArg::new(3, 8, 1)));
            let desc = TlsDesc::new_dynamic(arg);
            match unsafe { desc.kind() } {
                Some(TlsDescriptor::Dynamic(decoded)) => assert_eq!(decoded.tlsinfo.ti_module, 3),
                other => panic!("unexpected descriptor {:?}", other),
            }
        }
    }
}
