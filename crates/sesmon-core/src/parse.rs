//! SES element parsing, result equality and the change diff engine.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A complete observation of an enclosure, keyed by "type#number".
pub type ResultMap = BTreeMap<String, ElementResult>;

// Wire structure as emitted by `sg_ses --all --json`. Everything is
// optional; unknown fields are ignored.

#[derive(Debug, Default, Deserialize)]
struct Root {
    #[serde(default)]
    join_of_diagnostic_pages: JoinPages,
}

#[derive(Debug, Default, Deserialize)]
struct JoinPages {
    #[serde(default)]
    element_list: Vec<RawElement>,
}

#[derive(Debug, Default, Deserialize)]
struct RawElement {
    element_type: Option<RawCodeMeaning>,
    element_number: Option<i64>,
    status_descriptor: Option<RawStatusDescriptor>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCodeMeaning {
    i: Option<i64>,
    meaning: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatusDescriptor {
    status: Option<RawCodeMeaning>,
    prdfail: Option<i64>,
    disabled: Option<i64>,
    swap: Option<i64>,
    temperature: Option<RawCodeMeaning>,
    voltage: Option<RawVoltage>,
    current: Option<RawCurrent>,
}

#[derive(Debug, Default, Deserialize)]
struct RawVoltage {
    value_in_volts: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCurrent {
    value_in_amps: Option<String>,
}

/// One parsed SES element with the fields relevant for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ElementResult {
    pub element_type: i64,

    #[serde(rename = "element_type_number")]
    pub element_number: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type_desc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_desc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prdfail: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disabled: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voltage: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amperage: Option<String>,
}

/// A single difference between two polls for one element key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub id: String,

    pub element_type: i64,

    #[serde(rename = "element_type_number")]
    pub element_number: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element_type_desc: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<ElementResult>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<ElementResult>,
}

/// Derives the result-map key of an element.
pub fn key_for(result: &ElementResult) -> String {
    format!("{}#{}", result.element_type, result.element_number)
}

/// Parses a JSON-wrapped SES dump into a [`ResultMap`].
///
/// Elements missing `element_type.i` or `element_number` cannot be keyed and
/// are skipped. Free-form strings are whitespace-trimmed. An empty element
/// list yields an empty map, not an error.
pub fn parse_ses(data: &[u8]) -> Result<ResultMap> {
    let root: Root = serde_json::from_slice(data)
        .map_err(|err| Error::InvalidJson(format!("failure unmarshalling SES data: {err}")))?;

    let mut map = ResultMap::new();
    for el in root.join_of_diagnostic_pages.element_list {
        let Some(element_type) = el.element_type.as_ref().and_then(|t| t.i) else {
            continue; // required for the key
        };
        let Some(element_number) = el.element_number else {
            continue; // required for the key
        };

        let mut result = ElementResult {
            element_type,
            element_number,
            element_type_desc: el
                .element_type
                .as_ref()
                .and_then(|t| t.meaning.as_deref())
                .map(|m| m.trim().to_string()),
            ..ElementResult::default()
        };

        if let Some(sd) = el.status_descriptor {
            if let Some(status) = &sd.status {
                result.status = status.i;
                result.status_desc = status.meaning.as_deref().map(|m| m.trim().to_string());
            }
            result.prdfail = sd.prdfail;
            result.disabled = sd.disabled;
            result.swap = sd.swap;
            result.temperature = sd
                .temperature
                .as_ref()
                .and_then(|t| t.meaning.as_deref())
                .map(|m| m.trim().to_string());
            result.voltage = sd
                .voltage
                .as_ref()
                .and_then(|v| v.value_in_volts.as_deref())
                .map(|v| v.trim().to_string());
            result.amperage = sd
                .current
                .as_ref()
                .and_then(|c| c.value_in_amps.as_deref())
                .map(|c| c.trim().to_string());
        }

        map.insert(key_for(&result), result);
    }

    Ok(map)
}

/// Whether two results are equal for alerting purposes.
///
/// Only the fault-indicating fields participate: status, status text
/// (ASCII case-insensitive), prdfail, disabled and swap. Temperature,
/// voltage and amperage are metrics and would cause alert storms.
pub fn results_equal(a: &ElementResult, b: &ElementResult) -> bool {
    fn fold_eq(a: Option<&str>, b: Option<&str>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }

    a.status == b.status
        && fold_eq(a.status_desc.as_deref(), b.status_desc.as_deref())
        && a.prdfail == b.prdfail
        && a.disabled == b.disabled
        && a.swap == b.swap
}

/// Computes the changes between two successive observations.
///
/// A key present on only one side appears / disappears; a key present on
/// both sides is reported when unequal under [`results_equal`]. Identity
/// fields are carried from whichever side holds the key, preferring the
/// current observation.
pub fn diff_results(prev: &ResultMap, curr: &ResultMap) -> Vec<Change> {
    let mut keys: BTreeSet<&String> = prev.keys().collect();
    keys.extend(curr.keys());

    let mut out = Vec::new();
    for key in keys {
        let p = prev.get(key);
        let c = curr.get(key);

        if let (Some(p), Some(c)) = (p, c) {
            if results_equal(p, c) {
                continue;
            }
        }

        let Some(carrier) = c.or(p) else {
            continue;
        };

        let c_desc = c.and_then(|r| r.element_type_desc.as_deref());
        let p_desc = p.and_then(|r| r.element_type_desc.as_deref());
        let element_type_desc = if c_desc.is_some() || p_desc.is_some() {
            let current = c_desc.unwrap_or("");
            let previous = p_desc.unwrap_or("");
            Some(if current.is_empty() { previous } else { current }.to_string())
        } else {
            None
        };

        out.push(Change {
            id: key.clone(),
            element_type: carrier.element_type,
            element_number: carrier.element_number,
            element_type_desc,
            before: p.cloned(),
            after: c.cloned(),
        });
    }

    out
}

/// Formats changes as single-line texts, sorted by (type, number).
pub fn changes_as_text(changes: &mut [Change]) -> Vec<String> {
    changes.sort_by(|a, b| {
        (a.element_type, a.element_number).cmp(&(b.element_type, b.element_number))
    });

    changes.iter().map(format_change).collect()
}

/// Joins formatted change lines into a single alert message.
pub fn build_message(lines: &[String]) -> String {
    lines.join(" ")
}

fn format_change(ch: &Change) -> String {
    format!(
        "[element={:?} type={} number={} / Before: ({}) / After: ({})]",
        ch.id,
        fmt_opt_quoted(ch.element_type_desc.as_deref()),
        ch.element_number,
        format_side(ch.before.as_ref()),
        format_side(ch.after.as_ref()),
    )
}

fn format_side(result: Option<&ElementResult>) -> String {
    let Some(r) = result else {
        return "-".to_string();
    };

    format!(
        "status={} status_txt={} prdfail={} disabled={} swap={} temp={} volt={} amp={}",
        fmt_opt_int(r.status),
        fmt_opt_quoted(r.status_desc.as_deref()),
        fmt_opt_int(r.prdfail),
        fmt_opt_int(r.disabled),
        fmt_opt_int(r.swap),
        fmt_opt_quoted(r.temperature.as_deref()),
        fmt_opt_quoted(r.voltage.as_deref()),
        fmt_opt_quoted(r.amperage.as_deref()),
    )
}

fn fmt_opt_int(value: Option<i64>) -> String {
    value.map_or_else(|| "-".to_string(), |n| n.to_string())
}

fn fmt_opt_quoted(value: Option<&str>) -> String {
    value.map_or_else(|| "-".to_string(), |s| format!("{s:?}"))
}
