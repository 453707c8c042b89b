use fxhash::FxHashMap;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::str::FromStr;

use super::channel_settings::ChannelConfig;
use super::error::RulesError;
use super::event::Event;

/// Comparison operator of a flag rule. Counter values are compared with
/// signed semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FromStr for CompareOp {
    type Err = RulesError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "==" => Ok(Self::Eq),
            "!=" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            _ => Err(RulesError::UnknownCompareOp(s.to_string())),
        }
    }
}

impl CompareOp {
    fn eval(self, lhs: i64, rhs: i64) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
        }
    }
}

/// Logical operator of an acceptance rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

impl FromStr for LogicOp {
    type Err = RulesError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AND" => Ok(Self::And),
            "OR" => Ok(Self::Or),
            _ => Err(RulesError::UnknownLogicOp(s.to_string())),
        }
    }
}

/// On-disk rule declaration, discriminated by the `Type` field.
#[derive(Debug, Deserialize)]
#[serde(tag = "Type")]
enum RuleDecl {
    Counter {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Tags")]
        tags: Vec<String>,
    },
    Flag {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Monitor")]
        monitor: String,
        #[serde(rename = "Operator")]
        operator: String,
        #[serde(rename = "Value")]
        value: i32,
    },
    Accept {
        #[serde(rename = "Name")]
        name: String,
        #[serde(rename = "Monitor")]
        monitors: Vec<String>,
        #[serde(rename = "Operator")]
        operator: String,
    },
}

/// A tag-based per-event hit counter.
///
/// The condition table is precomputed from the channel configuration: entry
/// `[module][channel]` is true when the channel carries any of the counter's
/// tags. Each event hit on such a channel increments the counter once.
#[derive(Debug, Clone)]
pub struct Counter {
    pub name: String,
    pub count: u64,
    table: Vec<Vec<bool>>,
}

impl Counter {
    fn new(name: String, tags: &[String], channels: &ChannelConfig) -> Self {
        let table = (0..channels.n_modules())
            .map(|module| {
                (0..channels.n_channels(module))
                    .map(|channel| {
                        channels
                            .get(module as u8, channel as u8)
                            .map(|s| s.has_any_tag(tags))
                            .unwrap_or(false)
                    })
                    .collect()
            })
            .collect();
        Self {
            name,
            count: 0,
            table,
        }
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn check(&mut self, module: u8, channel: u8) {
        if let Some(&matched) = self
            .table
            .get(module as usize)
            .and_then(|m| m.get(channel as usize))
        {
            if matched {
                self.count += 1;
            }
        }
    }
}

/// A boolean derived from one counter. A flag whose monitor does not resolve
/// keeps its default false.
#[derive(Debug, Clone)]
pub struct Flag {
    pub name: String,
    pub value: bool,
    monitor: Option<usize>,
    op: CompareOp,
    threshold: i32,
}

impl Flag {
    fn evaluate(&mut self, counters: &[Counter]) {
        if let Some(index) = self.monitor {
            self.value = self.op.eval(counters[index].count as i64, self.threshold as i64);
        }
    }
}

/// The accept/reject expression over a set of flags.
#[derive(Debug, Clone)]
pub struct Acceptance {
    pub name: String,
    monitors: Vec<usize>,
    op: LogicOp,
}

impl Acceptance {
    fn evaluate(&self, flags: &[Flag]) -> bool {
        match self.op {
            // AND needs at least one resolved monitor: an acceptance whose
            // monitors all failed to resolve must not accept everything.
            LogicOp::And => {
                !self.monitors.is_empty() && self.monitors.iter().all(|&i| flags[i].value)
            }
            LogicOp::Or => self.monitors.iter().any(|&i| flags[i].value),
        }
    }
}

/// The full ordered L2 rule set. Workers clone one instance each; evaluation
/// mutates only local counter and flag state.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    counters: Vec<Counter>,
    flags: Vec<Flag>,
    acceptances: Vec<Acceptance>,
}

impl RuleSet {
    /// Load and resolve the rules file against the channel configuration.
    /// Unknown operators are fatal; monitor names that resolve to nothing
    /// are reported and left inert.
    pub fn load(path: &Path, channels: &ChannelConfig) -> Result<Self, RulesError> {
        if !path.exists() {
            return Err(RulesError::BadFilePath(path.to_path_buf()));
        }
        let reader = BufReader::new(File::open(path)?);
        let decls: Vec<RuleDecl> = serde_json::from_reader(reader)?;
        Self::from_decls(decls, channels)
    }

    fn from_decls(decls: Vec<RuleDecl>, channels: &ChannelConfig) -> Result<Self, RulesError> {
        let mut counters: Vec<Counter> = Vec::new();
        for decl in &decls {
            if let RuleDecl::Counter { name, tags } = decl {
                log::info!("Counter {}: tags {:?}", name, tags);
                counters.push(Counter::new(name.clone(), tags, channels));
            }
        }
        let counter_index: FxHashMap<&str, usize> = counters
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.as_str(), i))
            .collect();

        let mut flags: Vec<Flag> = Vec::new();
        for decl in &decls {
            if let RuleDecl::Flag {
                name,
                monitor,
                operator,
                value,
            } = decl
            {
                let index = counter_index.get(monitor.as_str()).copied();
                if index.is_none() {
                    log::warn!(
                        "Flag {} monitors unknown counter {}; it will stay false",
                        name,
                        monitor
                    );
                }
                log::info!("Flag {}: {} {} {}", name, monitor, operator, value);
                flags.push(Flag {
                    name: name.clone(),
                    value: false,
                    monitor: index,
                    op: operator.parse()?,
                    threshold: *value,
                });
            }
        }
        let flag_index: FxHashMap<&str, usize> = flags
            .iter()
            .enumerate()
            .map(|(i, f)| (f.name.as_str(), i))
            .collect();

        let mut acceptances: Vec<Acceptance> = Vec::new();
        for decl in &decls {
            if let RuleDecl::Accept {
                name,
                monitors,
                operator,
            } = decl
            {
                let mut resolved = Vec::new();
                for monitor in monitors {
                    match flag_index.get(monitor.as_str()) {
                        Some(&i) => resolved.push(i),
                        None => log::warn!(
                            "Acceptance {} monitors unknown flag {}; ignoring it",
                            name,
                            monitor
                        ),
                    }
                }
                log::info!("Acceptance {}: {} over {:?}", name, operator, monitors);
                acceptances.push(Acceptance {
                    name: name.clone(),
                    monitors: resolved,
                    op: operator.parse()?,
                });
            }
        }

        Ok(Self {
            counters,
            flags,
            acceptances,
        })
    }

    pub fn n_counters(&self) -> usize {
        self.counters.len()
    }

    pub fn n_flags(&self) -> usize {
        self.flags.len()
    }

    /// Evaluate one event: reset and fill every counter, re-derive every
    /// flag, then accept if any acceptance rule passes.
    pub fn evaluate(&mut self, event: &Event) -> bool {
        for counter in &mut self.counters {
            counter.reset();
            for hit in &event.hits {
                counter.check(hit.module, hit.channel);
            }
        }
        for flag in &mut self.flags {
            flag.evaluate(&self.counters);
        }
        self.acceptances.iter().any(|a| a.evaluate(&self.flags))
    }

    /// Current counter values, in declaration order.
    pub fn counter_snapshot(&self) -> Vec<u64> {
        self.counters.iter().map(|c| c.count).collect()
    }

    /// Current flag values, in declaration order.
    pub fn flag_snapshot(&self) -> Vec<bool> {
        self.flags.iter().map(|f| f.value).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel_settings::{ChannelConfig, ChannelSetting};
    use crate::event::EventHit;

    fn tagged_channels() -> ChannelConfig {
        // Module 0: two E_Sector channels; module 1: one dE_Sector channel.
        let mut rows: Vec<Vec<ChannelSetting>> = vec![Vec::new(), Vec::new()];
        for (module, channel, tag) in [(0u32, 0u32, "E_Sector"), (0, 1, "E_Sector"), (1, 0, "dE_Sector")]
        {
            let json = serde_json::json!({
                "IsEventTrigger": false,
                "ID": (module * 2 + channel) as i32,
                "Module": module,
                "Channel": channel,
                "ThresholdADC": 0,
                "HasAC": false,
                "ACModule": 128,
                "ACChannel": 128,
                "Phi": 0.0, "Theta": 0.0, "Distance": 0.0,
                "x": 0.0, "y": 0.0, "z": 0.0,
                "p0": 0.0, "p1": 1.0, "p2": 0.0, "p3": 0.0,
                "DetectorType": "si",
                "Tags": [tag],
            });
            let setting: ChannelSetting = serde_json::from_value(json).unwrap();
            rows[module as usize].push(setting);
        }
        ChannelConfig::from_channels(rows)
    }

    fn si_rules(channels: &ChannelConfig) -> RuleSet {
        let decls = serde_json::from_str::<Vec<RuleDecl>>(
            r#"[
                {"Type": "Counter", "Name": "E_Sector", "Tags": ["E_Sector"]},
                {"Type": "Counter", "Name": "dE_Sector", "Tags": ["dE_Sector"]},
                {"Type": "Flag", "Name": "E_Pos", "Monitor": "E_Sector", "Operator": ">", "Value": 0},
                {"Type": "Flag", "Name": "dE_Pos", "Monitor": "dE_Sector", "Operator": ">", "Value": 0},
                {"Type": "Accept", "Name": "Si_Both", "Monitor": ["E_Pos", "dE_Pos"], "Operator": "AND"}
            ]"#,
        )
        .unwrap();
        RuleSet::from_decls(decls, channels).unwrap()
    }

    fn hit(module: u8, channel: u8) -> EventHit {
        EventHit {
            module,
            channel,
            charge_long: 100,
            charge_short: 10,
            time_ns: 0.0,
            with_ac: false,
        }
    }

    #[test]
    fn and_acceptance_needs_every_flag() {
        let channels = tagged_channels();
        let mut rules = si_rules(&channels);

        // Two E hits, no dE hit: E_Pos true, dE_Pos false, AND rejects.
        let mut event = Event::new(0.0);
        event.hits = vec![hit(0, 0), hit(0, 1)];
        assert!(!rules.evaluate(&event));
        assert_eq!(rules.counter_snapshot(), vec![2, 0]);
        assert_eq!(rules.flag_snapshot(), vec![true, false]);

        // One of each: accepted.
        event.hits = vec![hit(0, 0), hit(1, 0)];
        assert!(rules.evaluate(&event));
        assert_eq!(rules.counter_snapshot(), vec![1, 1]);
        assert_eq!(rules.flag_snapshot(), vec![true, true]);
    }

    #[test]
    fn empty_event_resets_counters_and_rejects() {
        let channels = tagged_channels();
        let mut rules = si_rules(&channels);

        let mut event = Event::new(0.0);
        event.hits = vec![hit(0, 0), hit(1, 0)];
        assert!(rules.evaluate(&event));

        // Counters must reset between events; all-zero counters fail >0.
        let empty = Event::new(1.0);
        assert!(!rules.evaluate(&empty));
        assert_eq!(rules.counter_snapshot(), vec![0, 0]);
        assert_eq!(rules.flag_snapshot(), vec![false, false]);
    }

    #[test]
    fn or_acceptance_and_signed_comparisons() {
        let channels = tagged_channels();
        let decls = serde_json::from_str::<Vec<RuleDecl>>(
            r#"[
                {"Type": "Counter", "Name": "E_Sector", "Tags": ["E_Sector"]},
                {"Type": "Flag", "Name": "None", "Monitor": "E_Sector", "Operator": "<=", "Value": -1},
                {"Type": "Flag", "Name": "Some", "Monitor": "E_Sector", "Operator": ">=", "Value": 1},
                {"Type": "Accept", "Name": "Any", "Monitor": ["None", "Some"], "Operator": "OR"}
            ]"#,
        )
        .unwrap();
        let mut rules = RuleSet::from_decls(decls, &channels).unwrap();

        // A zero counter is not <= -1 under signed comparison.
        assert!(!rules.evaluate(&Event::new(0.0)));

        let mut event = Event::new(0.0);
        event.hits = vec![hit(0, 0)];
        assert!(rules.evaluate(&event));
    }

    #[test]
    fn unresolved_monitors_stay_inert() {
        let channels = tagged_channels();
        let decls = serde_json::from_str::<Vec<RuleDecl>>(
            r#"[
                {"Type": "Counter", "Name": "E_Sector", "Tags": ["E_Sector"]},
                {"Type": "Flag", "Name": "Ghost", "Monitor": "NoSuchCounter", "Operator": ">", "Value": 0},
                {"Type": "Accept", "Name": "A1", "Monitor": ["Ghost"], "Operator": "AND"},
                {"Type": "Accept", "Name": "A2", "Monitor": ["NoSuchFlag"], "Operator": "AND"}
            ]"#,
        )
        .unwrap();
        let mut rules = RuleSet::from_decls(decls, &channels).unwrap();

        let mut event = Event::new(0.0);
        event.hits = vec![hit(0, 0)];
        // Ghost keeps its default false; A2 resolved no monitors at all.
        assert!(!rules.evaluate(&event));
    }

    #[test]
    fn unknown_operator_is_fatal() {
        let channels = tagged_channels();
        let decls = serde_json::from_str::<Vec<RuleDecl>>(
            r#"[
                {"Type": "Counter", "Name": "C", "Tags": ["E_Sector"]},
                {"Type": "Flag", "Name": "F", "Monitor": "C", "Operator": "~", "Value": 0}
            ]"#,
        )
        .unwrap();
        assert!(matches!(
            RuleSet::from_decls(decls, &channels),
            Err(RulesError::UnknownCompareOp(_))
        ));
    }
}
