//! Batch configuration and JSON batch plans
//!
//! [`BatchConfig`] holds the buffer size, sequence seed and ack default of a
//! [`Batch`]. A [`BatchPlan`] describes whole batches in JSON and is turned
//! into a framed batch by [`BatchPlan::build`].

use crate::core::attr::{AttrKind, AttrSpec, AttrTable, AttrValue, Attributes};
use crate::core::batch::Batch;
use crate::core::element::{ELEMENT_ATTRIBUTES, Element};
use crate::core::error::{Access, Error, Result};
use crate::core::netlink::{Family, SOCKET_BUFFER_SIZE};
use crate::core::set::{SET_ATTRIBUTES, Set};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;

/// Batch construction knobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Buffer capacity in bytes. Defaults to the socket buffer size.
    #[serde(default)]
    pub buffer_size: Option<usize>,
    /// Fixed first sequence number; derived from the clock when absent.
    #[serde(default)]
    pub seq_seed: Option<u32>,
    /// Ack request applied to plan operations that don't set their own
    #[serde(default = "default_true")]
    pub ack: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            buffer_size: None,
            seq_seed: None,
            ack: true,
        }
    }
}

impl BatchConfig {
    pub fn buffer_size(&self) -> usize {
        self.buffer_size.unwrap_or(*SOCKET_BUFFER_SIZE)
    }
}

fn default_true() -> bool {
    true
}

fn default_ops() -> Vec<PlanOp> {
    vec![PlanOp::SetPut, PlanOp::ElementPut]
}

/// Family given by name (`"ipv4"`, `"ip6"`, ...) or as a raw protocol number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlanFamily {
    Named(Family),
    Raw(u8),
}

impl From<PlanFamily> for u8 {
    fn from(family: PlanFamily) -> Self {
        match family {
            PlanFamily::Named(family) => family.into(),
            PlanFamily::Raw(raw) => raw,
        }
    }
}

/// Operations a plan can queue for one set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum PlanOp {
    #[strum(serialize = "set_put")]
    SetPut,
    #[strum(serialize = "set_delete")]
    SetDelete,
    #[strum(serialize = "element_put")]
    ElementPut,
    #[strum(serialize = "element_delete")]
    ElementDelete,
}

/// One set in a plan: its attributes, its elements, and what to queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPlan {
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    #[serde(default)]
    pub elements: Vec<BTreeMap<String, Value>>,
    #[serde(default = "default_ops")]
    pub ops: Vec<PlanOp>,
    /// Overrides the plan's ack default for this set
    #[serde(default)]
    pub ack: Option<bool>,
}

/// JSON description of a whole batch
///
/// ```json
/// {
///   "batch": { "seq_seed": 1000 },
///   "family": "ipv4",
///   "sets": [{
///     "attributes": { "table": "filter", "name": "blocklist", "key_len": 4 },
///     "elements": [{ "key": "192.0.2.1" }, { "key": [198, 51, 100, 7] }]
///   }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    #[serde(default)]
    pub batch: BatchConfig,
    pub family: PlanFamily,
    #[serde(default)]
    pub sets: Vec<SetPlan>,
}

/// Loads a plan from a JSON file.
pub fn load_plan(path: &Path) -> Result<BatchPlan> {
    let json = std::fs::read_to_string(path)?;
    let plan = serde_json::from_str(&json)?;
    tracing::debug!(path = %path.display(), "loaded batch plan");
    Ok(plan)
}

impl BatchPlan {
    /// Builds the sets and elements, then frames every operation into a
    /// closed-off batch (begin and end markers written).
    ///
    /// The sets are returned alongside the batch because they own the
    /// element records the batch was built from.
    pub fn build(&self) -> Result<(Batch, Vec<Set>)> {
        let sets = self
            .sets
            .iter()
            .map(SetPlan::build_set)
            .collect::<Result<Vec<_>>>()?;

        let mut batch = Batch::with_config(self.batch.clone());
        batch.begin()?;
        for (plan, set) in self.sets.iter().zip(&sets) {
            let ack = plan.ack.unwrap_or(self.batch.ack);
            for op in &plan.ops {
                match op {
                    PlanOp::SetPut => batch.queue_set_put(set, self.family, ack)?,
                    PlanOp::SetDelete => batch.queue_set_delete(set, self.family, ack)?,
                    PlanOp::ElementPut => batch.queue_element_put(set, self.family, ack)?,
                    PlanOp::ElementDelete => batch.queue_element_delete(set, self.family, ack)?,
                };
            }
        }
        batch.end()?;
        Ok((batch, sets))
    }
}

impl SetPlan {
    fn build_set(&self) -> Result<Set> {
        let mut set = Set::new();
        apply(&mut set, &SET_ATTRIBUTES, &self.attributes)?;
        for attrs in &self.elements {
            let mut element = Element::new();
            apply(&mut element, &ELEMENT_ATTRIBUTES, attrs)?;
            set.add_element(&mut element)?;
        }
        Ok(set)
    }
}

fn apply<T: Attributes>(
    target: &mut T,
    table: &AttrTable,
    attrs: &BTreeMap<String, Value>,
) -> Result<()> {
    for (name, value) in attrs {
        let spec = table.resolve(name, Access::Write)?;
        target.set_attribute(name, value_from_json(spec, value)?)?;
    }
    Ok(())
}

/// Kind a JSON value would naturally map to, for mismatch reports.
fn json_kind(value: &Value) -> AttrKind {
    match value {
        Value::String(_) => AttrKind::String,
        Value::Number(_) => AttrKind::U64,
        _ => AttrKind::Raw,
    }
}

/// Converts a JSON value into the kind the attribute table expects.
///
/// Byte attributes accept an array of octets, an IP address string or a
/// `0x`-prefixed hex string.
pub fn value_from_json(spec: &AttrSpec, value: &Value) -> Result<AttrValue> {
    let mismatch = || Error::TypeMismatch {
        name: spec.name.to_string(),
        expected: spec.kind,
        actual: json_kind(value),
    };

    match (spec.kind, value) {
        (AttrKind::String, Value::String(s)) => Ok(AttrValue::String(s.clone())),
        (AttrKind::U32, Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .map(AttrValue::U32)
            .ok_or_else(|| Error::Plan(format!("{}: {n} is not a u32", spec.name))),
        (AttrKind::U64, Value::Number(n)) => n
            .as_u64()
            .map(AttrValue::U64)
            .ok_or_else(|| Error::Plan(format!("{}: {n} is not a u64", spec.name))),
        (AttrKind::Raw, Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| Error::Plan(format!("{}: {item} is not an octet", spec.name)))
            })
            .collect::<Result<Vec<u8>>>()
            .map(AttrValue::Raw),
        (AttrKind::Raw, Value::String(s)) => {
            if let Ok(addr) = s.parse::<IpAddr>() {
                Ok(addr.into())
            } else if let Some(hex) = s.strip_prefix("0x") {
                parse_hex(hex)
                    .map(AttrValue::Raw)
                    .ok_or_else(|| Error::Plan(format!("{}: invalid hex {s:?}", spec.name)))
            } else {
                Err(mismatch())
            }
        }
        _ => Err(mismatch()),
    }
}

fn parse_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::netlink::{Header, NftCommand, messages};
    use serde_json::json;
    use std::io::Write;

    const BLOCKLIST_PLAN: &str = r#"{
        "batch": { "seq_seed": 1000 },
        "family": "ipv4",
        "sets": [{
            "attributes": { "table": "filter", "name": "blocklist", "key_len": 4, "timeout": 60000 },
            "elements": [{ "key": "192.0.2.1" }, { "key": [198, 51, 100, 7], "timeout": 1000 }]
        }]
    }"#;

    #[test]
    fn test_config_defaults() {
        let config: BatchConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, BatchConfig::default());
        assert!(config.ack);
        assert_eq!(config.buffer_size(), *SOCKET_BUFFER_SIZE);
    }

    #[test]
    fn test_load_and_build_plan() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(BLOCKLIST_PLAN.as_bytes()).unwrap();

        let plan = load_plan(file.path()).unwrap();
        assert_eq!(plan.family, PlanFamily::Named(Family::Ipv4));
        assert_eq!(plan.sets[0].ops, default_ops());

        let (batch, sets) = plan.build().unwrap();
        assert_eq!(sets[0].len(), 2);

        let dump = batch.dump();
        let headers: Vec<Header> = messages(&dump).map(|(h, _)| h).collect();
        let seqs: Vec<u32> = headers.iter().map(|h| h.seq).collect();
        assert_eq!(seqs, vec![1000, 1001, 1002, 1003]);
        assert_eq!(headers[1].msg_type, NftCommand::NewSet.msg_type());
        assert_eq!(headers[2].msg_type, NftCommand::NewSetElem.msg_type());
    }

    #[test]
    fn test_missing_plan_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_plan(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_raw_family_and_explicit_ops() {
        let plan: BatchPlan = serde_json::from_value(json!({
            "batch": { "seq_seed": 1, "ack": false },
            "family": 7,
            "sets": [{ "attributes": { "name": "s" }, "ops": ["set_delete"] }]
        }))
        .unwrap();
        assert_eq!(plan.family, PlanFamily::Raw(7));

        let (batch, _) = plan.build().unwrap();
        let dump = batch.dump();
        let (header, body) = messages(&dump).nth(1).unwrap();
        assert_eq!(header.msg_type, NftCommand::DelSet.msg_type());
        assert_eq!(header.flags, crate::core::netlink::NLM_F_REQUEST);
        assert_eq!(body[0], 7);
    }

    #[test]
    fn test_value_conversion() {
        let key = ELEMENT_ATTRIBUTES.lookup("key").unwrap();
        assert_eq!(
            value_from_json(key, &json!("2001:db8::1")).unwrap().as_bytes().unwrap().len(),
            16
        );
        assert_eq!(
            value_from_json(key, &json!("0x0016")).unwrap(),
            AttrValue::Raw(vec![0x00, 0x16])
        );
        assert!(matches!(
            value_from_json(key, &json!("0x123")),
            Err(Error::Plan(_))
        ));
        assert!(matches!(
            value_from_json(key, &json!([1, 256])),
            Err(Error::Plan(_))
        ));

        let flags = SET_ATTRIBUTES.lookup("flags").unwrap();
        assert!(matches!(
            value_from_json(flags, &json!(5_000_000_000u64)),
            Err(Error::Plan(_))
        ));
        assert!(matches!(
            value_from_json(flags, &json!("3")),
            Err(Error::TypeMismatch {
                expected: AttrKind::U32,
                actual: AttrKind::String,
                ..
            })
        ));
    }

    #[test]
    fn test_plan_rejects_read_only_attribute() {
        let plan: BatchPlan = serde_json::from_value(json!({
            "family": "ipv4",
            "sets": [{ "elements": [{ "expiration": 10 }] }]
        }))
        .unwrap();
        assert!(matches!(
            plan.build(),
            Err(Error::PermissionDenied { access: Access::Write, .. })
        ));
    }
}
