//! Cooperative timer wheel: a fixed pool of timer slots linked in a single
//! delta-encoded list ordered by expiry, so `process` only ever inspects the
//! head to decide whether anything is due. Actions are identified by a
//! small tag the node interprets (heartbeat producer, SDO watchdog, PDO
//! event timer, inhibit timer) rather than a boxed closure, keeping the
//! whole wheel allocation-free.

use crate::error::ErrorCode;

/// What a fired timer slot is for. The node matches on this to decide what
/// to do; the wheel itself is agnostic to the meaning.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Action {
    HeartbeatProducer,
    HeartbeatConsumer { node_id: u8 },
    SdoServerWatchdog { server: u8 },
    TpdoEvent { tpdo: u8 },
    TpdoInhibit { tpdo: u8 },
    Sync,
}

#[derive(Clone, Copy)]
struct Slot {
    action: Action,
    /// Milliseconds after the previous slot in the chain (or after "now" for
    /// the head) until this slot fires. Delta-encoding keeps `process`'s
    /// per-tick cost independent of how far out the furthest timer is.
    delta_ms: u32,
    /// `None` once fired for a one-shot timer; for periodic timers this is
    /// re-armed with the same period in `process`.
    period_ms: Option<u32>,
    next: Option<usize>,
}

/// A handle returned by `create`, used to `cancel` a timer later.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct TimerHandle(usize);

/// Fixed-size delta list. `N` is the maximum number of timers live at once.
pub struct Wheel<const N: usize> {
    slots: [Option<Slot>; N],
    head: Option<usize>,
}

impl<const N: usize> Wheel<N> {
    pub const fn new() -> Self {
        Wheel { slots: [None; N], head: None }
    }

    /// Schedules `action` to fire in `delay_ms`. If `period_ms` is `Some`,
    /// the timer re-arms itself with that period each time it fires.
    pub fn create(&mut self, action: Action, delay_ms: u32, period_ms: Option<u32>) -> Result<TimerHandle, ErrorCode> {
        let idx = self.slots.iter().position(Option::is_none).ok_or(ErrorCode::TmrNoAct)?;

        // Walk the chain to find the insertion point, decrementing `delay`
        // by each predecessor's delta so only the relative gap is stored.
        let mut remaining = delay_ms;
        let mut prev: Option<usize> = None;
        let mut cursor = self.head;
        while let Some(c) = cursor {
            let slot = self.slots[c].as_ref().unwrap();
            if remaining < slot.delta_ms {
                break;
            }
            remaining -= slot.delta_ms;
            prev = Some(c);
            cursor = slot.next;
        }

        self.slots[idx] = Some(Slot { action, delta_ms: remaining, period_ms, next: cursor });
        if let Some(c) = cursor {
            let following_delta = self.slots[c].as_ref().unwrap().delta_ms - remaining;
            self.slots[c].as_mut().unwrap().delta_ms = following_delta;
        }
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = Some(idx),
            None => self.head = Some(idx),
        }
        Ok(TimerHandle(idx))
    }

    /// Removes a timer before it fires. A no-op if it already fired and was
    /// one-shot.
    pub fn cancel(&mut self, handle: TimerHandle) -> Result<(), ErrorCode> {
        let idx = handle.0;
        if idx >= N || self.slots[idx].is_none() {
            return Ok(());
        }
        let removed_delta = self.slots[idx].as_ref().unwrap().delta_ms;
        let removed_next = self.slots[idx].as_ref().unwrap().next;

        if self.head == Some(idx) {
            self.head = removed_next;
        } else {
            let mut cursor = self.head;
            while let Some(c) = cursor {
                let slot = self.slots[c].as_ref().unwrap();
                if slot.next == Some(idx) {
                    self.slots[c].as_mut().unwrap().next = removed_next;
                    break;
                }
                cursor = slot.next;
            }
        }
        if let Some(next) = removed_next {
            self.slots[next].as_mut().unwrap().delta_ms += removed_delta;
        }
        self.slots[idx] = None;
        Ok(())
    }

    /// Advances the wheel by `elapsed_ms` and invokes `on_fire` for every
    /// action that became due, in firing order. Periodic timers are
    /// re-inserted with their original period; one-shots are dropped.
    pub fn process(&mut self, mut elapsed_ms: u32, mut on_fire: impl FnMut(Action)) {
        while elapsed_ms > 0 {
            let Some(head) = self.head else { break };
            let head_delta = self.slots[head].as_ref().unwrap().delta_ms;
            if head_delta > elapsed_ms {
                self.slots[head].as_mut().unwrap().delta_ms -= elapsed_ms;
                break;
            }
            elapsed_ms -= head_delta;

            let slot = self.slots[head].take().unwrap();
            self.head = slot.next;
            on_fire(slot.action);

            if let Some(period) = slot.period_ms {
                // Re-arm with the leftover of this tick already accounted for.
                let _ = self.create(slot.action, period, Some(period));
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }
}
