/// One hit inside a built event. `time_ns` is relative to the event's
/// trigger time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventHit {
    pub module: u8,
    pub channel: u8,
    pub charge_long: u16,
    pub charge_short: u16,
    pub time_ns: f64,
    pub with_ac: bool,
}

/// A built physics event.
///
/// `hits[0]` is the trigger hit at relative time zero; the remaining hits are
/// sorted by relative time and lie strictly inside the open coincidence
/// window.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Event {
    pub trigger_time_ns: f64,
    pub hits: Vec<EventHit>,
}

impl Event {
    pub fn new(trigger_time_ns: f64) -> Self {
        Self {
            trigger_time_ns,
            hits: Vec::new(),
        }
    }
}
