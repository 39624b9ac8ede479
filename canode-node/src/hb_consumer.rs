//! Heartbeat consumer
//!
//! Object 0x1016 lists the remote nodes to monitor, one entry per sub index, each encoded as
//! `node_id << 16 | time_ms`. A node is monitored once its first heartbeat arrives. Missing
//! heartbeats for longer than `time_ms` raise the heartbeat consumer error.
use canode_common::{
    constants::object_ids,
    messages::{CanMessage, NmtState, HEARTBEAT_ID},
    sdo::AbortCode,
    AtomicCell,
};
use defmt_or_log::{debug, warn};

use crate::{
    emcy::{error_bit, error_code, Emergency},
    object_dict::{exact_bytes, extension_init, find_object, ODEntry, ObjectAccess, ObjectExtension},
};

/// Monitoring state of one heartbeat consumer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HbConsumerState {
    /// The entry is not used
    #[default]
    Unconfigured,
    /// Configured, but no heartbeat received yet
    Unknown,
    /// Heartbeats are arriving in time
    Active,
    /// The heartbeat timed out
    Timeout,
}

/// Events reported to the heartbeat consumer callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum HbConsumerEvent {
    /// The NMT state reported by a monitored node changed. `None` means unknown.
    NmtChanged {
        /// Remote node ID
        node_id: u8,
        /// Consumer entry index
        idx: u8,
        /// The new state
        state: Option<NmtState>,
    },
    /// The first heartbeat of a monitored node arrived
    Started {
        /// Remote node ID
        node_id: u8,
        /// Consumer entry index
        idx: u8,
    },
    /// A monitored node's heartbeat timed out
    Timeout {
        /// Remote node ID
        node_id: u8,
        /// Consumer entry index
        idx: u8,
    },
    /// A monitored node sent a bootup message
    RemoteReset {
        /// Remote node ID
        node_id: u8,
        /// Consumer entry index
        idx: u8,
    },
}

/// Callback type for heartbeat consumer events
pub type HbConsumerCallback = dyn Fn(HbConsumerEvent) + Sync;

#[derive(Debug, Clone, Copy, Default)]
struct EntryRuntime {
    state: HbConsumerState,
    nmt_state: Option<NmtState>,
    prev_nmt_state: Option<NmtState>,
    timer_us: u32,
}

/// One monitored node
#[allow(missing_debug_implementations)]
pub struct HbConsumerEntry {
    config: AtomicCell<(u8, u16)>,
    rx: AtomicCell<Option<u8>>,
    runtime: AtomicCell<EntryRuntime>,
}

impl Default for HbConsumerEntry {
    fn default() -> Self {
        Self::new()
    }
}

impl HbConsumerEntry {
    /// Create an unconfigured entry
    pub const fn new() -> Self {
        Self {
            config: AtomicCell::new((0, 0)),
            rx: AtomicCell::new(None),
            runtime: AtomicCell::new(EntryRuntime {
                state: HbConsumerState::Unconfigured,
                nmt_state: None,
                prev_nmt_state: None,
                timer_us: 0,
            }),
        }
    }

    /// The monitored node ID, or 0 if unused
    pub fn node_id(&self) -> u8 {
        self.config.load().0
    }

    /// The consumer time in ms
    pub fn time_ms(&self) -> u16 {
        self.config.load().1
    }

    /// The current monitoring state
    pub fn state(&self) -> HbConsumerState {
        self.runtime.load().state
    }

    /// The last NMT state reported by the monitored node
    pub fn nmt_state(&self) -> Option<NmtState> {
        self.runtime.load().nmt_state
    }

    fn configure(&self, node_id: u8, time_ms: u16) {
        let used = node_id != 0 && time_ms != 0;
        self.config.store(if used { (node_id, time_ms) } else { (node_id, 0) });
        self.rx.store(None);
        self.runtime.store(EntryRuntime {
            state: if used {
                HbConsumerState::Unknown
            } else {
                HbConsumerState::Unconfigured
            },
            ..Default::default()
        });
    }
}

/// Check a 0x1016 entry value against the other entries
fn validate_entry(entries: &[HbConsumerEntry], idx: usize, value: u32) -> Result<(u8, u16), AbortCode> {
    if value & 0xFF80_0000 != 0 {
        return Err(AbortCode::IncompatibleParameter);
    }
    let node_id = (value >> 16) as u8;
    let time_ms = value as u16;
    if node_id != 0 && time_ms != 0 {
        let duplicate = entries
            .iter()
            .enumerate()
            .any(|(i, e)| i != idx && e.time_ms() != 0 && e.node_id() == node_id);
        if duplicate {
            return Err(AbortCode::IncompatibleParameter);
        }
    }
    Ok((node_id, time_ms))
}

/// The consumer entries, and the extension on object 0x1016
#[allow(missing_debug_implementations)]
pub struct HeartbeatConsumer<const N: usize> {
    entries: [HbConsumerEntry; N],
}

impl<const N: usize> Default for HeartbeatConsumer<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> HeartbeatConsumer<N> {
    /// Create a consumer with all entries unconfigured
    pub const fn new() -> Self {
        Self {
            entries: [const { HbConsumerEntry::new() }; N],
        }
    }

    /// Access the entries
    pub fn entries(&self) -> &[HbConsumerEntry] {
        &self.entries
    }
}

impl<const N: usize> ObjectExtension for HeartbeatConsumer<N> {
    fn write(
        &self,
        _index: u16,
        object: &dyn ObjectAccess,
        sub: u8,
        data: &[u8],
    ) -> Result<(), AbortCode> {
        let Some(entry) = (sub as usize)
            .checked_sub(1)
            .and_then(|idx| self.entries.get(idx))
        else {
            return object.write(sub, data);
        };
        let value = u32::from_le_bytes(exact_bytes(data)?);
        let (node_id, time_ms) = validate_entry(&self.entries, sub as usize - 1, value)?;
        object.write(sub, data)?;
        debug!("HB consumer {} monitors node {} at {} ms", sub, node_id, time_ms);
        entry.configure(node_id, time_ms);
        Ok(())
    }
}

/// Load the consumer entries from object 0x1016 and install the extension
pub(crate) fn init_consumer(
    entries: &[HbConsumerEntry],
    extension: &'static dyn ObjectExtension,
    od: &'static [ODEntry<'static>],
) {
    let object = find_object(od, object_ids::HEARTBEAT_CONSUMER_TIME);
    for entry in entries {
        entry.configure(0, 0);
    }
    if let Some(object) = object {
        for (idx, entry) in entries.iter().enumerate() {
            let Ok(value) = object.read_u32(idx as u8 + 1) else {
                continue;
            };
            match validate_entry(entries, idx, value) {
                Ok((node_id, time_ms)) => entry.configure(node_id, time_ms),
                Err(_) => warn!("Ignoring invalid HB consumer entry {}: 0x{:x}", idx + 1, value),
            }
        }
        extension_init(od, object_ids::HEARTBEAT_CONSUMER_TIME, extension).ok();
    }
}

/// Store a received heartbeat in the matching entry
///
/// Returns true if the frame was a heartbeat from a monitored node.
pub(crate) fn receive_heartbeat(entries: &[HbConsumerEntry], msg: &CanMessage) -> bool {
    let id = msg.id();
    if id.is_extended() || id.raw() & !0x7F != HEARTBEAT_ID as u32 {
        return false;
    }
    let node_id = (id.raw() & 0x7F) as u8;
    let mut consumed = false;
    for entry in entries {
        let (entry_node, time_ms) = entry.config.load();
        if time_ms != 0 && entry_node == node_id {
            if let [state] = msg.data() {
                entry.rx.store(Some(*state));
            }
            consumed = true;
        }
    }
    consumed
}

/// Processing side state of the heartbeat consumer
#[derive(Debug, Default)]
pub(crate) struct HbMonitor {
    all_active: bool,
    all_operational: bool,
    pre_or_operational_prev: bool,
}

impl HbMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when every configured entry is active
    pub fn all_active(&self) -> bool {
        self.all_active
    }

    /// True when every configured remote node reports Operational
    pub fn all_operational(&self) -> bool {
        self.all_operational
    }

    pub fn process(
        &mut self,
        entries: &[HbConsumerEntry],
        pre_or_operational: bool,
        elapsed_us: u32,
        emcy: &Emergency,
        callback: Option<&HbConsumerCallback>,
    ) {
        let notify = |event| {
            if let Some(cb) = callback {
                cb(event)
            }
        };
        let mut all_active = true;
        let mut all_operational = true;

        if pre_or_operational && self.pre_or_operational_prev {
            for (i, entry) in entries.iter().enumerate() {
                let mut rt = entry.runtime.load();
                if rt.state == HbConsumerState::Unconfigured {
                    continue;
                }
                let (node_id, time_ms) = entry.config.load();
                let idx = i as u8;
                let mut elapsed = elapsed_us;

                if let Some(raw) = entry.rx.take() {
                    let state = NmtState::try_from(raw & 0x7F).ok();
                    if state == Some(NmtState::Bootup) {
                        notify(HbConsumerEvent::RemoteReset { node_id, idx });
                        if rt.state == HbConsumerState::Active {
                            warn!("Node {} reset while monitored", node_id);
                            emcy.error_report(
                                error_bit::HB_CONSUMER_REMOTE_RESET,
                                error_code::HEARTBEAT,
                                i as u32,
                            );
                        }
                        rt.state = HbConsumerState::Unknown;
                    } else {
                        if rt.state != HbConsumerState::Active {
                            notify(HbConsumerEvent::Started { node_id, idx });
                        }
                        rt.state = HbConsumerState::Active;
                        rt.timer_us = 0;
                        elapsed = 0;
                    }
                    rt.nmt_state = state;
                }

                if rt.state == HbConsumerState::Active {
                    rt.timer_us = rt.timer_us.saturating_add(elapsed);
                    if rt.timer_us >= time_ms as u32 * 1000 {
                        warn!("Heartbeat from node {} timed out", node_id);
                        notify(HbConsumerEvent::Timeout { node_id, idx });
                        emcy.error_report(
                            error_bit::HEARTBEAT_CONSUMER,
                            error_code::HEARTBEAT,
                            i as u32,
                        );
                        rt.nmt_state = None;
                        rt.state = HbConsumerState::Timeout;
                    }
                }

                if rt.state != HbConsumerState::Active {
                    all_active = false;
                }
                if rt.nmt_state != Some(NmtState::Operational) {
                    all_operational = false;
                }
                if rt.nmt_state != rt.prev_nmt_state {
                    notify(HbConsumerEvent::NmtChanged {
                        node_id,
                        idx,
                        state: rt.nmt_state,
                    });
                    rt.prev_nmt_state = rt.nmt_state;
                }
                entry.runtime.store(rt);
            }
        } else if pre_or_operational || self.pre_or_operational_prev {
            for entry in entries {
                entry.rx.store(None);
                let _ = entry.runtime.fetch_update(|mut rt| {
                    rt.nmt_state = None;
                    rt.prev_nmt_state = None;
                    if rt.state != HbConsumerState::Unconfigured {
                        rt.state = HbConsumerState::Unknown;
                    }
                    Some(rt)
                });
            }
            all_active = false;
            all_operational = false;
        }

        if !self.all_active && all_active {
            emcy.error_reset(error_bit::HEARTBEAT_CONSUMER, 0);
            emcy.error_reset(error_bit::HB_CONSUMER_REMOTE_RESET, 0);
        }
        self.all_active = all_active;
        self.all_operational = all_operational;
        self.pre_or_operational_prev = pre_or_operational;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::object_dict::{ArrayObject, ExtendableObject, ScalarField};
    use canode_common::{objects::SubInfo, CanId};

    type ConsumerObject = ExtendableObject<ArrayObject<ScalarField<u32>, 2>>;

    fn setup(
        values: [u32; 2],
    ) -> (&'static HeartbeatConsumer<2>, &'static ConsumerObject) {
        let object: &'static ConsumerObject = Box::leak(Box::new(ExtendableObject::new(
            ArrayObject::new(
                [ScalarField::<u32>::new(values[0]), ScalarField::<u32>::new(values[1])],
                SubInfo::new_u32().rw_access(),
            ),
        )));
        let od: &'static [ODEntry<'static>] = Box::leak(Box::new([ODEntry {
            index: 0x1016,
            data: object,
        }]));
        let consumer: &'static HeartbeatConsumer<2> = Box::leak(Box::new(HeartbeatConsumer::new()));
        init_consumer(consumer.entries(), consumer, od);
        (consumer, object)
    }

    fn heartbeat(node: u8, state: u8) -> CanMessage {
        CanMessage::new(CanId::Std(0x700 + node as u16), &[state])
    }

    #[test]
    fn test_entry_validation() {
        let (consumer, object) = setup([0x0005_0064, 0]);
        assert_eq!(HbConsumerState::Unknown, consumer.entries()[0].state());
        assert_eq!(5, consumer.entries()[0].node_id());

        // Same node twice
        assert_eq!(
            Err(AbortCode::IncompatibleParameter),
            object.write(2, &0x0005_0010u32.to_le_bytes())
        );
        // Reserved bits
        assert_eq!(
            Err(AbortCode::IncompatibleParameter),
            object.write(2, &0x0080_0010u32.to_le_bytes())
        );
        // Duplicate with time 0 is allowed
        object.write(2, &0x0005_0000u32.to_le_bytes()).unwrap();
        assert_eq!(HbConsumerState::Unconfigured, consumer.entries()[1].state());
        object.write(2, &0x0006_0010u32.to_le_bytes()).unwrap();
        assert_eq!(HbConsumerState::Unknown, consumer.entries()[1].state());
        assert_eq!(0x0006_0010, object.read_u32(2).unwrap());
    }

    #[test]
    fn test_timeout_and_remote_reset() {
        let (consumer, _) = setup([0x0005_0064, 0]);
        let entries = consumer.entries();
        let emcy = Emergency::new();
        let events: &'static Mutex<Vec<HbConsumerEvent>> = Box::leak(Box::new(Mutex::new(Vec::new())));
        let callback: &'static HbConsumerCallback =
            Box::leak(Box::new(|event: HbConsumerEvent| events.lock().unwrap().push(event)));
        let mut monitor = HbMonitor::new();

        // Must see two cycles in pre-operational before monitoring starts
        monitor.process(entries, true, 1000, &emcy, Some(callback));
        assert!(receive_heartbeat(entries, &heartbeat(5, 0x05)));
        assert!(!receive_heartbeat(entries, &heartbeat(6, 0x05)));
        monitor.process(entries, true, 1000, &emcy, Some(callback));
        assert_eq!(HbConsumerState::Active, entries[0].state());
        assert!(monitor.all_active());
        assert!(monitor.all_operational());
        assert_eq!(
            vec![
                HbConsumerEvent::Started { node_id: 5, idx: 0 },
                HbConsumerEvent::NmtChanged {
                    node_id: 5,
                    idx: 0,
                    state: Some(NmtState::Operational)
                },
            ],
            *events.lock().unwrap()
        );

        monitor.process(entries, true, 99_000, &emcy, Some(callback));
        assert!(!emcy.is_error(error_bit::HEARTBEAT_CONSUMER));
        monitor.process(entries, true, 1_000, &emcy, Some(callback));
        assert_eq!(HbConsumerState::Timeout, entries[0].state());
        assert!(emcy.is_error(error_bit::HEARTBEAT_CONSUMER));

        receive_heartbeat(entries, &heartbeat(5, 0x7F));
        monitor.process(entries, true, 1_000, &emcy, Some(callback));
        assert!(!emcy.is_error(error_bit::HEARTBEAT_CONSUMER));

        // Bootup while active
        receive_heartbeat(entries, &heartbeat(5, 0));
        monitor.process(entries, true, 1_000, &emcy, Some(callback));
        assert!(emcy.is_error(error_bit::HB_CONSUMER_REMOTE_RESET));
        assert_eq!(HbConsumerState::Unknown, entries[0].state());
        assert!(events
            .lock()
            .unwrap()
            .contains(&HbConsumerEvent::RemoteReset { node_id: 5, idx: 0 }));
    }

    #[test]
    fn test_stopped_clears_state() {
        let (consumer, _) = setup([0x0005_0064, 0]);
        let entries = consumer.entries();
        let emcy = Emergency::new();
        let mut monitor = HbMonitor::new();
        monitor.process(entries, true, 1000, &emcy, None);
        receive_heartbeat(entries, &heartbeat(5, 0x05));
        monitor.process(entries, true, 1000, &emcy, None);
        assert_eq!(HbConsumerState::Active, entries[0].state());

        monitor.process(entries, false, 1000, &emcy, None);
        assert_eq!(HbConsumerState::Unknown, entries[0].state());
        assert_eq!(None, entries[0].nmt_state());
        // No timeouts while not monitoring
        monitor.process(entries, false, 1_000_000, &emcy, None);
        assert!(!emcy.is_error(error_bit::HEARTBEAT_CONSUMER));
    }
}
