//! Signal numbering, masks, and per-process signal state.
//!
//! Five signal numbers double as sentinel handler values in the `sigaction`
//! payload: installing one of them selects the corresponding kernel handler
//! instead of a user function. Any signal without an explicit handler
//! defaults to kill.

use bitmaps::Bitmap;
use const_zero::const_zero;
use zerocopy::{AsBytes, FromBytes};

/// Default signal handling.
pub const SIG_DFL: usize = 0;
/// Ignore signal.
pub const SIG_IGN: usize = 1;
pub const SIGKILL: usize = 9;
pub const SIGSTOP: usize = 17;
pub const SIGCONT: usize = 19;

/// Number of signals. Valid signal numbers are `0..NSIG`.
pub const NSIG: usize = 32;

/// A set of signal numbers.
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct SigSet(Bitmap<NSIG>);

impl SigSet {
    pub const EMPTY: Self = Self(unsafe { const_zero!(Bitmap::<NSIG>) });

    pub fn from_bits(bits: u32) -> Self {
        Self(Bitmap::from_value(bits))
    }

    pub fn bits(self) -> u32 {
        self.0.into_value()
    }

    pub fn get(&self, signum: usize) -> bool {
        self.0.get(signum)
    }

    pub fn add(&mut self, signum: usize) {
        let _ = self.0.set(signum, true);
    }

    pub fn remove(&mut self, signum: usize) {
        let _ = self.0.set(signum, false);
    }

    /// A mask is valid only if it can never block SIGKILL or SIGSTOP.
    pub fn is_valid_mask(&self) -> bool {
        !self.get(SIGKILL) && !self.get(SIGSTOP)
    }
}

/// The action taken when a signal is delivered.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SigHandler {
    Kernel(KernelHandler),
    /// Address of a handler function in user space.
    User(usize),
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum KernelHandler {
    Kill,
    Ignore,
    Stop,
    Cont,
}

impl SigHandler {
    /// Decode a handler address from a `SigAction` payload. The sentinel
    /// values select kernel handlers; anything else is a user function.
    pub fn decode(addr: usize) -> Self {
        match addr {
            SIG_DFL | SIGKILL => Self::Kernel(KernelHandler::Kill),
            SIG_IGN => Self::Kernel(KernelHandler::Ignore),
            SIGSTOP => Self::Kernel(KernelHandler::Stop),
            SIGCONT => Self::Kernel(KernelHandler::Cont),
            _ => Self::User(addr),
        }
    }

    /// Encode back into a `SigAction` payload. Kernel handlers encode as the
    /// sentinel of the signal they implement, so decode(encode(h)) == h.
    pub fn encode(self) -> usize {
        match self {
            Self::Kernel(KernelHandler::Kill) => SIGKILL,
            Self::Kernel(KernelHandler::Ignore) => SIG_IGN,
            Self::Kernel(KernelHandler::Stop) => SIGSTOP,
            Self::Kernel(KernelHandler::Cont) => SIGCONT,
            Self::User(addr) => addr,
        }
    }
}

/// The user-space `sigaction` payload: a handler address and the mask to
/// apply while that handler runs.
#[repr(C)]
#[derive(Copy, Clone, AsBytes, FromBytes)]
pub struct SigAction {
    pub handler: usize,
    pub mask: u32,
    _pad: u32,
}

impl SigAction {
    pub fn new(handler: usize, mask: u32) -> Self {
        Self {
            handler,
            mask,
            _pad: 0,
        }
    }
}

/// Per-process signal state. The process lock must be held when using this.
pub struct SignalState {
    /// Signals sent but not yet delivered.
    pending: SigSet,

    /// Signals currently blocked from delivery.
    mask: SigSet,

    handlers: [SigHandler; NSIG],

    /// Mask to install while the corresponding handler runs.
    handler_masks: [SigSet; NSIG],

    /// Set by SIGSTOP, cleared by SIGCONT. While set, the scheduler does not
    /// dispatch this process's threads.
    pub stopped: bool,

    /// A handler is running; delivery is suppressed until it finishes.
    handling: bool,

    /// The mask to restore when the running handler finishes.
    mask_backup: SigSet,
}

impl SignalState {
    pub const fn new() -> Self {
        let mut handlers = [SigHandler::Kernel(KernelHandler::Kill); NSIG];
        handlers[SIG_IGN] = SigHandler::Kernel(KernelHandler::Ignore);
        handlers[SIGSTOP] = SigHandler::Kernel(KernelHandler::Stop);
        handlers[SIGCONT] = SigHandler::Kernel(KernelHandler::Cont);
        Self {
            pending: SigSet::EMPTY,
            mask: SigSet::EMPTY,
            handlers,
            handler_masks: [SigSet::EMPTY; NSIG],
            stopped: false,
            handling: false,
            mask_backup: SigSet::EMPTY,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    pub fn handler(&self, signum: usize) -> SigHandler {
        self.handlers[signum]
    }

    /// Atomically swap the process mask, returning the previous mask.
    /// Fails if the new mask would block SIGKILL or SIGSTOP.
    pub fn swap_mask(&mut self, new: SigSet) -> Result<SigSet, ()> {
        if !new.is_valid_mask() {
            return Err(());
        }
        let old = self.mask;
        self.mask = new;
        Ok(old)
    }

    /// The currently installed action for `signum`, in payload form.
    pub fn action(&self, signum: usize) -> SigAction {
        SigAction::new(
            self.handlers[signum].encode(),
            self.handler_masks[signum].bits(),
        )
    }

    /// Install a new action for `signum`. SIGKILL and SIGSTOP cannot be
    /// overridden, and the deferred mask may not block them.
    pub fn register(&mut self, signum: usize, act: SigAction) -> Result<(), ()> {
        if signum == SIGKILL || signum == SIGSTOP {
            return Err(());
        }
        let mask = SigSet::from_bits(act.mask);
        if !mask.is_valid_mask() {
            return Err(());
        }
        self.handlers[signum] = SigHandler::decode(act.handler);
        self.handler_masks[signum] = mask;
        Ok(())
    }

    /// A forked child inherits the parent's mask and handler table, but not
    /// its pending set or stopped/handling state.
    pub fn inherit_from(&mut self, parent: &SignalState) {
        self.mask = parent.mask;
        self.handlers = parent.handlers;
        self.handler_masks = parent.handler_masks;
    }

    /// Record `signum` as pending.
    pub fn send(&mut self, signum: usize) {
        self.pending.add(signum);
    }

    /// The lowest-numbered signal that is pending and not masked, if any.
    /// Returns `None` while a handler is already running.
    pub fn next_deliverable(&self) -> Option<usize> {
        if self.handling {
            return None;
        }
        (0..NSIG).find(|&n| self.pending.get(n) && !self.mask.get(n))
    }

    /// The scheduler's stop gate: a stopped process may run only to deliver
    /// an unmasked pending SIGCONT.
    pub fn can_dispatch(&self) -> bool {
        !self.stopped || (self.pending.get(SIGCONT) && !self.mask.get(SIGCONT))
    }

    /// Enter handler delivery for `signum`: save the mask and install the
    /// handler's deferred mask.
    pub fn begin_handler(&mut self, signum: usize) {
        self.mask_backup = self.mask;
        self.mask = self.handler_masks[signum];
        self.handling = true;
        self.pending.remove(signum);
    }

    /// Finish a handler (a kernel handler returning, or sigreturn after a
    /// user handler): restore the saved mask and re-enable delivery.
    pub fn finish_handler(&mut self) {
        self.mask = self.mask_backup;
        self.handling = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_set_has_no_bits() {
        let set = SigSet::EMPTY;
        assert_eq!(set.bits(), 0);
        assert!((0..NSIG).all(|n| !set.get(n)));
    }

    #[test]
    fn set_round_trips_through_bits() {
        let mut set = SigSet::EMPTY;
        set.add(3);
        set.add(15);
        assert_eq!(set.bits(), (1 << 3) | (1 << 15));
        assert_eq!(SigSet::from_bits(set.bits()), set);
        set.remove(3);
        assert!(!set.get(3));
        assert!(set.get(15));
    }

    #[test]
    fn kill_and_stop_are_unmaskable() {
        assert!(SigSet::EMPTY.is_valid_mask());
        assert!(!SigSet::from_bits(1 << SIGKILL).is_valid_mask());
        assert!(!SigSet::from_bits(1 << SIGSTOP).is_valid_mask());
        assert!(SigSet::from_bits(1 << SIGCONT).is_valid_mask());
    }

    #[test]
    fn sentinels_decode_to_kernel_handlers() {
        assert_eq!(
            SigHandler::decode(SIG_DFL),
            SigHandler::Kernel(KernelHandler::Kill)
        );
        assert_eq!(
            SigHandler::decode(SIG_IGN),
            SigHandler::Kernel(KernelHandler::Ignore)
        );
        assert_eq!(
            SigHandler::decode(SIGKILL),
            SigHandler::Kernel(KernelHandler::Kill)
        );
        assert_eq!(
            SigHandler::decode(SIGSTOP),
            SigHandler::Kernel(KernelHandler::Stop)
        );
        assert_eq!(
            SigHandler::decode(SIGCONT),
            SigHandler::Kernel(KernelHandler::Cont)
        );
        assert_eq!(SigHandler::decode(0x8000_0000), SigHandler::User(0x8000_0000));
    }

    #[test]
    fn handlers_survive_an_encode_decode_round_trip() {
        for addr in [SIG_DFL, SIG_IGN, SIGKILL, SIGSTOP, SIGCONT, 0x4000] {
            let handler = SigHandler::decode(addr);
            assert_eq!(SigHandler::decode(handler.encode()), handler);
        }
    }

    #[test]
    fn default_table_kills_unhandled_signals() {
        let state = SignalState::new();
        for n in 0..NSIG {
            let expected = match n {
                SIG_IGN => SigHandler::Kernel(KernelHandler::Ignore),
                SIGSTOP => SigHandler::Kernel(KernelHandler::Stop),
                SIGCONT => SigHandler::Kernel(KernelHandler::Cont),
                _ => SigHandler::Kernel(KernelHandler::Kill),
            };
            assert_eq!(state.handler(n), expected, "signal {}", n);
        }
    }

    #[test]
    fn swap_mask_returns_previous_mask() {
        let mut state = SignalState::new();
        let m1 = SigSet::from_bits(1 << 5);
        let m2 = SigSet::from_bits(1 << 7);
        assert_eq!(state.swap_mask(m1).unwrap(), SigSet::EMPTY);
        assert_eq!(state.swap_mask(m2).unwrap(), m1);
        assert!(state.swap_mask(SigSet::from_bits(1 << SIGKILL)).is_err());
        // A rejected swap leaves the mask unchanged.
        assert_eq!(state.swap_mask(SigSet::EMPTY).unwrap(), m2);
    }

    #[test]
    fn register_rejects_kill_and_stop() {
        let mut state = SignalState::new();
        assert!(state.register(SIGKILL, SigAction::new(0x4000, 0)).is_err());
        assert!(state.register(SIGSTOP, SigAction::new(0x4000, 0)).is_err());
        assert!(state
            .register(2, SigAction::new(0x4000, 1 << SIGKILL))
            .is_err());
        assert!(state.register(2, SigAction::new(0x4000, 1 << 2)).is_ok());
        assert_eq!(state.handler(2), SigHandler::User(0x4000));
    }

    #[test]
    fn actions_round_trip_through_registration() {
        let mut state = SignalState::new();
        let before = state.action(4);
        let mut saved = SigAction::new(0, 0);

        // Install a user handler, saving the old action; then reinstall the
        // saved action.
        saved.handler = state.action(4).handler;
        saved.mask = state.action(4).mask;
        state.register(4, SigAction::new(0x7000, 1 << 4)).unwrap();
        state.register(4, saved).unwrap();

        assert_eq!(state.action(4).handler, before.handler);
        assert_eq!(state.action(4).mask, before.mask);
    }

    #[test]
    fn delivery_is_lowest_signal_first_and_respects_the_mask() {
        let mut state = SignalState::new();
        state.send(20);
        state.send(5);
        assert_eq!(state.next_deliverable(), Some(5));

        let _ = state.swap_mask(SigSet::from_bits(1 << 5)).unwrap();
        assert_eq!(state.next_deliverable(), Some(20));

        let _ = state
            .swap_mask(SigSet::from_bits((1 << 5) | (1 << 20)))
            .unwrap();
        assert_eq!(state.next_deliverable(), None);
    }

    #[test]
    fn begin_handler_clears_the_pending_bit() {
        let mut state = SignalState::new();
        state.send(6);
        state.send(8);
        state.begin_handler(6);
        state.finish_handler();
        assert_eq!(state.next_deliverable(), Some(8));
        state.begin_handler(8);
        state.finish_handler();
        assert_eq!(state.next_deliverable(), None);
    }

    #[test]
    fn handler_mask_is_installed_and_restored() {
        let mut state = SignalState::new();
        state
            .register(10, SigAction::new(0x5000, 1 << 12))
            .unwrap();
        let _ = state.swap_mask(SigSet::from_bits(1 << 3)).unwrap();

        state.begin_handler(10);
        // While handling, the deferred mask blocks 12 and delivery is off.
        state.send(12);
        assert_eq!(state.next_deliverable(), None);

        state.finish_handler();
        assert_eq!(state.swap_mask(SigSet::EMPTY).unwrap().bits(), 1 << 3);
        assert_eq!(state.next_deliverable(), Some(12));
    }

    #[test]
    fn stop_gate_opens_only_for_unmasked_sigcont() {
        let mut state = SignalState::new();
        assert!(state.can_dispatch());

        state.stopped = true;
        assert!(!state.can_dispatch());

        state.send(SIGCONT);
        assert!(state.can_dispatch());

        // SIGCONT pending but masked: still stopped.
        let _ = state.swap_mask(SigSet::from_bits(1 << SIGCONT)).unwrap();
        assert!(!state.can_dispatch());
    }
}
