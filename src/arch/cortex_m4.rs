//! # Cortex-M4 Port Layer
//!
//! Hardware-specific code for the ARM Cortex-M4 (Thumb-2) processor.
//! Implements [`Port`] with PRIMASK masking and PendSV context switches,
//! plus SysTick configuration and the first-thread launch.
//!
//! ## Context Switch Mechanism
//!
//! The Cortex-M4 uses a split-stack model:
//! - **MSP** (Main Stack Pointer): used by `main` and interrupt handlers
//! - **PSP** (Process Stack Pointer): used by threads in Thread mode
//!
//! The kernel only *requests* a switch: [`Port::context_switch`] records the
//! pair and pends PendSV. PendSV runs once no other handler is active and
//! interrupts are unmasked, saves R4–R11 and EXC_RETURN (plus S16–S31 when
//! the thread used the FPU) on the outgoing stack and restores the incoming
//! one. Several requests before PendSV runs collapse into one switch from
//! the thread the CPU is actually on.
//!
//! ## Interrupt Priorities
//!
//! - SysTick: 0xFF (lowest)
//! - PendSV: 0xFF (lowest), so a switch never preempts another handler

use core::arch::{asm, naked_asm};
use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use cortex_m::peripheral::syst::SystClkSource;
use cortex_m::peripheral::SCB;
use cortex_m::register::primask;

use super::Port;
use crate::config::{SYSTEM_CLOCK_HZ, TICK_HZ};
use crate::thread::{ThreadEntry, ThreadId};

/// Thumb state bit of an initial xPSR.
const XPSR_THUMB: u32 = 0x0100_0000;

/// Return to Thread mode on PSP, basic (non-FP) frame.
const EXC_RETURN_THREAD_PSP: u32 = 0xFFFF_FFFD;

/// Words in the hardware-stacked frame (R0–R3, R12, LR, PC, xPSR).
const HW_FRAME_WORDS: usize = 8;

/// Words in the software-saved frame (R4–R11, EXC_RETURN).
const SW_FRAME_WORDS: usize = 9;

const NO_THREAD: u8 = u8::MAX;

static SWITCH_PENDING: AtomicBool = AtomicBool::new(false);
static SWITCH_FROM: AtomicU8 = AtomicU8::new(NO_THREAD);
static SWITCH_TO: AtomicU8 = AtomicU8::new(NO_THREAD);

/// The Cortex-M4 port.
pub struct CortexM4;

impl Port for CortexM4 {
    /// PRIMASK was clear (interrupts enabled) on entry.
    type Level = bool;

    #[inline]
    fn disable_interrupts() -> bool {
        let was_active = primask::read().is_active();
        cortex_m::interrupt::disable();
        was_active
    }

    #[inline]
    fn restore_interrupts(was_active: bool) {
        if was_active {
            unsafe { cortex_m::interrupt::enable() };
        }
    }

    fn context_switch(from: Option<ThreadId>, to: ThreadId) {
        // Keep the first `from`: its context is the one still on the CPU.
        if !SWITCH_PENDING.swap(true, Ordering::AcqRel) {
            SWITCH_FROM.store(from.map_or(NO_THREAD, |f| f.0), Ordering::Relaxed);
        }
        SWITCH_TO.store(to.0, Ordering::Release);
        SCB::set_pendsv();
    }

    fn init_stack(stack: &mut [u8], entry: ThreadEntry, parameter: usize) -> usize {
        let base = stack.as_ptr() as usize;
        let top = (base + stack.len()) & !0x07;
        let frame_words = HW_FRAME_WORDS + SW_FRAME_WORDS;
        let sp = top - frame_words * 4;

        let mut frame = [0u32; HW_FRAME_WORDS + SW_FRAME_WORDS];
        // Software frame: R4–R11 zeroed, then EXC_RETURN.
        frame[SW_FRAME_WORDS - 1] = EXC_RETURN_THREAD_PSP;
        // Hardware frame.
        let hw = &mut frame[SW_FRAME_WORDS..];
        hw[0] = parameter as u32; // R0
        hw[5] = crate::os::thread_exit as usize as u32; // LR
        hw[6] = (entry as usize as u32) & !1; // PC
        hw[7] = XPSR_THUMB;

        let offset = sp - base;
        for (i, word) in frame.iter().enumerate() {
            let at = offset + i * 4;
            stack[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
        sp
    }
}

/// Take the switch requested since the last PendSV, if any.
pub(crate) fn take_switch() -> Option<(Option<ThreadId>, ThreadId)> {
    if !SWITCH_PENDING.swap(false, Ordering::AcqRel) {
        return None;
    }
    let from = SWITCH_FROM.swap(NO_THREAD, Ordering::Relaxed);
    let to = SWITCH_TO.load(Ordering::Acquire);
    let from = (from != NO_THREAD).then_some(ThreadId(from));
    Some((from, ThreadId(to)))
}

// ---------------------------------------------------------------------------
// SysTick and priorities
// ---------------------------------------------------------------------------

/// Configure SysTick to fire at `TICK_HZ` from the core clock.
pub fn configure_systick(syst: &mut cortex_m::peripheral::SYST) {
    let reload = SYSTEM_CLOCK_HZ / TICK_HZ - 1;
    syst.set_reload(reload);
    syst.clear_current();
    syst.set_clock_source(SystClkSource::Core);
    syst.enable_counter();
    syst.enable_interrupt();
}

/// Set PendSV and SysTick to the lowest interrupt priority.
pub fn set_interrupt_priorities() {
    unsafe {
        // System Handler Priority Register 3 (SHPR3): 0xE000_ED20
        // Bits [23:16] = PendSV priority
        // Bits [31:24] = SysTick priority
        let shpr3: *mut u32 = 0xE000_ED20 as *mut u32;
        let val = core::ptr::read_volatile(shpr3);
        let val = val | (0xFF << 16) | (0xFF << 24);
        core::ptr::write_volatile(shpr3, val);
    }
}

// ---------------------------------------------------------------------------
// First thread launch
// ---------------------------------------------------------------------------

/// Switch Thread mode to PSP and enter the thread whose saved stack
/// pointer is `sp`, unmasking interrupts on the way.
///
/// # Safety
/// Call once, with interrupts masked, with `sp` built by `init_stack`.
pub unsafe fn start_first_task(sp: usize) -> ! {
    asm!(
        // Skip the software frame; nothing in it matters for a fresh thread.
        "adds r0, #36",
        "msr psp, r0",

        // CONTROL.SPSEL = 1: Thread mode uses PSP.
        "movs r0, #2",
        "msr control, r0",
        "isb",

        // Unstack the hardware frame by hand.
        "pop {{r0-r3, r12, lr}}",
        "pop {{r4, r5}}",      // PC, xPSR
        "orr r4, r4, #1",      // BX needs the Thumb bit
        "cpsie i",
        "bx r4",

        in("r0") sp,
        options(noreturn)
    );
}

// ---------------------------------------------------------------------------
// Exception handlers
// ---------------------------------------------------------------------------

/// PendSV: save the outgoing context, let the kernel swap stack pointers,
/// restore the incoming context.
///
/// # Safety
/// Entered by the NVIC only.
#[no_mangle]
#[unsafe(naked)]
pub unsafe extern "C" fn PendSV() {
    naked_asm!(
        "mrs r0, psp",
        "tst lr, #0x10",
        "it eq",
        "vstmdbeq r0!, {{s16-s31}}",
        "stmdb r0!, {{r4-r11, lr}}",

        "bl {switch}",          // r0: saved PSP in, next PSP out

        "ldmia r0!, {{r4-r11, lr}}",
        "tst lr, #0x10",
        "it eq",
        "vldmiaeq r0!, {{s16-s31}}",
        "msr psp, r0",
        "bx lr",

        switch = sym switch_stacks,
    );
}

/// Store `psp` into the outgoing TCB and return the incoming one's.
extern "C" fn switch_stacks(psp: usize) -> usize {
    match take_switch() {
        Some((from, to)) => crate::os::swap_stack_pointers(from, psp, to),
        None => psp,
    }
}

/// SysTick: one kernel tick.
#[no_mangle]
pub unsafe extern "C" fn SysTick() {
    crate::os::tick();
}
