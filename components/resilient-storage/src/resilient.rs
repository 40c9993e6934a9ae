use core::{cmp::min, ops::Range};

use storage_device::{
    check_span, check_transfer, Result, StorageDevice, StorageError, StorageHealth,
    MAX_TRANSFER_SIZE,
};

use crate::{dirty::DirtyRanges, DeviceStats, ResilientConfig, ResilientState, ResilientStats};

/// Transition callback used when no observer is installed.
pub type Observer = fn(ResilientState, ResilientState);

fn ignore_transition(_old: ResilientState, _new: ResilientState) {}

enum Op<'a> {
    Read(u32, &'a mut [u8]),
    Write(u32, &'a [u8]),
    Erase(u32, u32),
}

impl Op<'_> {
    fn written(&self) -> Option<Range<u32>> {
        match self {
            Op::Write(address, data) => Some(*address..*address + data.len() as u32),
            _ => None,
        }
    }

    fn apply<D: StorageDevice>(&mut self, device: &mut D, stats: &mut DeviceStats) -> Result<()> {
        let result = match self {
            Op::Read(address, buf) => device.read(*address, buf),
            Op::Write(address, data) => device.write(*address, data),
            Op::Erase(address, len) => device.erase(*address, *len),
        };
        match (&result, self) {
            (Err(_), _) => stats.errors = stats.errors.saturating_add(1),
            (Ok(()), Op::Read(..)) => stats.reads = stats.reads.saturating_add(1),
            (Ok(()), Op::Write(..)) => stats.writes = stats.writes.saturating_add(1),
            (Ok(()), Op::Erase(..)) => {}
        }
        result
    }
}

/// A primary and a fallback device behind one [`StorageDevice`].
///
/// The usable address space is the smaller of the two capacities. The
/// observer `O` is called with `(old, new)` on every state change and
/// captures whatever context it needs.
///
/// Writes served by the fallback are remembered until
/// [`sync_to_primary`](Self::sync_to_primary) copies them over; a later
/// write to the primary drops the overlapping part. The record lives in RAM
/// only and does not survive a reset.
pub struct ResilientStorage<P, F, O = Observer> {
    primary: P,
    fallback: F,
    config: ResilientConfig,
    observer: O,
    state: ResilientState,
    stats: ResilientStats,
    consecutive_errors: u32,
    fallback_errors: u32,
    ops_since_probe: u32,
    retry_interval: u32,
    unsynced: DirtyRanges,
}

impl<P, F> ResilientStorage<P, F> {
    pub fn new(primary: P, fallback: F, config: ResilientConfig) -> Self {
        Self {
            primary,
            fallback,
            config,
            observer: ignore_transition,
            state: ResilientState::Failed,
            stats: ResilientStats::default(),
            consecutive_errors: 0,
            fallback_errors: 0,
            ops_since_probe: 0,
            retry_interval: config.initial_retry_interval,
            unsynced: DirtyRanges::new(),
        }
    }
}

impl<P, F, O> ResilientStorage<P, F, O> {
    pub fn with_observer<N>(self, observer: N) -> ResilientStorage<P, F, N>
    where
        N: FnMut(ResilientState, ResilientState),
    {
        ResilientStorage {
            primary: self.primary,
            fallback: self.fallback,
            config: self.config,
            observer,
            state: self.state,
            stats: self.stats,
            consecutive_errors: self.consecutive_errors,
            fallback_errors: self.fallback_errors,
            ops_since_probe: self.ops_since_probe,
            retry_interval: self.retry_interval,
            unsynced: self.unsynced,
        }
    }

    pub fn state(&self) -> ResilientState {
        self.state
    }

    pub fn stats(&self) -> ResilientStats {
        self.stats
    }

    pub fn config(&self) -> &ResilientConfig {
        &self.config
    }

    /// Fallback operations between two primary probes.
    pub fn retry_interval(&self) -> u32 {
        self.retry_interval
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    /// Fallback writes not copied to the primary yet.
    pub fn unsynced(&self) -> &DirtyRanges {
        &self.unsynced
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn primary_mut(&mut self) -> &mut P {
        &mut self.primary
    }

    pub fn fallback(&self) -> &F {
        &self.fallback
    }

    pub fn fallback_mut(&mut self) -> &mut F {
        &mut self.fallback
    }

    pub fn release(self) -> (P, F) {
        (self.primary, self.fallback)
    }
}

impl<P, F, O> ResilientStorage<P, F, O>
where
    P: StorageDevice,
    F: StorageDevice,
    O: FnMut(ResilientState, ResilientState),
{
    fn transition(&mut self, new: ResilientState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        debug!("resilient {:?} -> {:?}", old, new);
        (self.observer)(old, new);
    }

    fn reset_backoff(&mut self) {
        self.ops_since_probe = 0;
        self.retry_interval = self.config.initial_retry_interval;
    }

    fn probe_primary(&mut self) -> Result<()> {
        self.primary.init()?;
        let mut buf = [0u8; MAX_TRANSFER_SIZE];
        let len = self.config.probe_len as usize;
        self.primary.read(self.config.probe_address, &mut buf[..len])
    }

    /// Runs a probe of the primary, returning to it on success.
    fn try_recover(&mut self) -> bool {
        self.stats.recovery_attempts = self.stats.recovery_attempts.saturating_add(1);
        self.transition(ResilientState::Recovering);
        match self.probe_primary() {
            Ok(()) => {
                self.consecutive_errors = 0;
                self.fallback_errors = 0;
                self.reset_backoff();
                self.stats.recoveries = self.stats.recoveries.saturating_add(1);
                info!("resilient: primary recovered");
                self.transition(ResilientState::Primary);
                true
            }
            Err(_e) => {
                self.stats.primary.errors = self.stats.primary.errors.saturating_add(1);
                self.ops_since_probe = 0;
                self.retry_interval = self.config.next_interval(self.retry_interval);
                warn!(
                    "resilient: primary probe failed ({:?}), next in {}",
                    _e, self.retry_interval
                );
                self.transition(ResilientState::Fallback);
                false
            }
        }
    }

    fn schedule_probe(&mut self) {
        self.ops_since_probe = self.ops_since_probe.saturating_add(1);
        if self.ops_since_probe >= self.retry_interval {
            self.try_recover();
        }
    }

    fn fail_over(&mut self) -> Result<()> {
        if !self.fallback.is_ready() && self.fallback.init().is_err() {
            error!("resilient: primary lost and fallback unusable");
            self.transition(ResilientState::Failed);
            return Err(StorageError::NotInitialized);
        }
        self.stats.failovers = self.stats.failovers.saturating_add(1);
        self.fallback_errors = 0;
        self.reset_backoff();
        warn!(
            "resilient: failing over after {} primary errors",
            self.consecutive_errors
        );
        self.transition(ResilientState::Fallback);
        Ok(())
    }

    fn fallback_lost(&mut self) {
        error!(
            "resilient: fallback failed {} times in a row",
            self.fallback_errors
        );
        if !self.try_recover() {
            self.transition(ResilientState::Failed);
        }
    }

    fn dispatch(&mut self, mut op: Op<'_>) -> Result<()> {
        match self.state {
            ResilientState::Failed | ResilientState::Recovering => {
                return Err(StorageError::NotInitialized)
            }
            ResilientState::Fallback => self.schedule_probe(),
            ResilientState::Primary => {}
        }

        if self.state == ResilientState::Primary {
            match op.apply(&mut self.primary, &mut self.stats.primary) {
                Ok(()) => {
                    self.consecutive_errors = 0;
                    if let Some(range) = op.written() {
                        self.unsynced.remove(range);
                    }
                    return Ok(());
                }
                Err(e) => {
                    self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                    warn!(
                        "resilient: primary error {:?} ({}/{})",
                        e, self.consecutive_errors, self.config.failure_threshold
                    );
                    if self.consecutive_errors < self.config.failure_threshold {
                        return Err(e);
                    }
                    self.fail_over()?;
                }
            }
        }

        match op.apply(&mut self.fallback, &mut self.stats.fallback) {
            Ok(()) => {
                self.fallback_errors = 0;
                if let Some(range) = op.written() {
                    self.unsynced.insert(range);
                }
                Ok(())
            }
            Err(e) => {
                self.fallback_errors = self.fallback_errors.saturating_add(1);
                if self.fallback_errors >= self.config.failure_threshold {
                    self.fallback_lost();
                }
                Err(e)
            }
        }
    }

    /// Copies what the fallback received inside `size` bytes at `address`
    /// back to the primary, e.g. after a recovery. Bytes the fallback never
    /// wrote are left alone. The primary must accept writes without a prior
    /// erase.
    pub fn sync_to_primary(&mut self, address: u32, size: u32) -> Result<()> {
        if self.state == ResilientState::Failed {
            return Err(StorageError::NotInitialized);
        }
        check_span(address, size, self.capacity())?;
        let window = address..address + size;

        let mut chunk = [0u8; MAX_TRANSFER_SIZE];
        while let Some(range) = self.unsynced.first_within(&window) {
            info!("resilient: sync {:x}..{:x} to primary", range.start, range.end);
            let mut offset = range.start;
            while offset < range.end {
                let len = min(range.end - offset, MAX_TRANSFER_SIZE as u32) as usize;
                let buf = &mut chunk[..len];
                Op::Read(offset, &mut *buf).apply(&mut self.fallback, &mut self.stats.fallback)?;
                Op::Write(offset, &*buf).apply(&mut self.primary, &mut self.stats.primary)?;
                offset += len as u32;
            }
            self.unsynced.remove(range);
        }
        Ok(())
    }
}

impl<P, F, O> StorageDevice for ResilientStorage<P, F, O>
where
    P: StorageDevice,
    F: StorageDevice,
    O: FnMut(ResilientState, ResilientState),
{
    /// Ends up on the primary if it initialises. The fallback is only
    /// initialised when the primary fails, here or on a later failover.
    /// Fails only when neither device is usable.
    fn init(&mut self) -> Result<()> {
        self.config.validate()?;
        self.consecutive_errors = 0;
        self.fallback_errors = 0;
        self.reset_backoff();

        let _primary = match self.primary.init() {
            Ok(()) => {
                info!("resilient: on primary");
                self.transition(ResilientState::Primary);
                return Ok(());
            }
            Err(e) => e,
        };
        warn!("resilient: primary init failed: {:?}", _primary);
        match self.fallback.init() {
            Ok(()) => {
                self.stats.failovers = self.stats.failovers.saturating_add(1);
                self.transition(ResilientState::Fallback);
                Ok(())
            }
            Err(_e) => {
                error!("resilient: no usable storage, fallback: {:?}", _e);
                self.transition(ResilientState::Failed);
                Err(StorageError::NotInitialized)
            }
        }
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<()> {
        check_transfer(address, buf.len(), self.capacity())?;
        self.dispatch(Op::Read(address, buf))
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<()> {
        check_transfer(address, data.len(), self.capacity())?;
        self.dispatch(Op::Write(address, data))
    }

    fn erase(&mut self, address: u32, len: u32) -> Result<()> {
        check_span(address, len, self.capacity())?;
        self.dispatch(Op::Erase(address, len))
    }

    fn capacity(&self) -> u32 {
        min(self.primary.capacity(), self.fallback.capacity())
    }

    fn is_ready(&self) -> bool {
        matches!(
            self.state,
            ResilientState::Primary | ResilientState::Fallback
        )
    }

    fn health(&self) -> StorageHealth {
        match self.state {
            ResilientState::Primary => self.primary.health(),
            ResilientState::Fallback | ResilientState::Recovering => StorageHealth {
                degraded: true,
                ..self.fallback.health()
            },
            ResilientState::Failed => {
                let primary = self.primary.health();
                let fallback = self.fallback.health();
                StorageHealth {
                    initialized: false,
                    healthy: false,
                    degraded: true,
                    error_count: primary.error_count.saturating_add(fallback.error_count),
                    write_count: primary.write_count.saturating_add(fallback.write_count),
                    health_percent: 0,
                }
            }
        }
    }
}
