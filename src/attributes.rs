//! Per-(server, path) notification attributes.
//!
//! A Write-Attributes request (`PUT /3/0/9?pmin=5&pmax=60`) stores pacing
//! and threshold controls keyed by the short server id of the origin server
//! and the target path. Lookup walks from the most specific path to the
//! least specific, so a `pmin` on `/3` applies to `/3/0/9` unless a more
//! specific entry overrides it; what neither level sets falls back to the
//! server object's defaults.

use std::collections::HashMap;
use std::str::FromStr;

use crate::types::{Path, ResultCode};

/// One level's attribute overlay. `None` marks an attribute as unset at this
/// level (the validity mask of the wire representation).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NotificationAttributes {
    pub pmin: Option<i64>,
    pub pmax: Option<i64>,
    pub gt: Option<f64>,
    pub lt: Option<f64>,
    pub stp: Option<f64>,
}

impl NotificationAttributes {
    /// Fields set on `self` win; the rest come from `base`.
    pub fn merged_over(self, base: Self) -> Self {
        Self {
            pmin: self.pmin.or(base.pmin),
            pmax: self.pmax.or(base.pmax),
            gt: self.gt.or(base.gt),
            lt: self.lt.or(base.lt),
            stp: self.stp.or(base.stp),
        }
    }
}

/// The recognized Write-Attributes keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKey {
    MinimumPeriod,
    MaximumPeriod,
    GreaterThan,
    LessThan,
    Step,
    Cancel,
}

impl FromStr for AttributeKey {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pmin" => AttributeKey::MinimumPeriod,
            "pmax" => AttributeKey::MaximumPeriod,
            "gt" => AttributeKey::GreaterThan,
            "lt" => AttributeKey::LessThan,
            "stp" => AttributeKey::Step,
            "cancel" => AttributeKey::Cancel,
            _ => return Err(()),
        })
    }
}

/// Outcome of applying a Write-Attributes query.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeUpdate {
    pub attributes: NotificationAttributes,
    /// The query carried `cancel`; the origin's observation on the path is
    /// to be dropped.
    pub cancel: bool,
}

/// Validate a Write-Attributes query against `existing` and produce the
/// updated overlay. Changes are built on a copy and only returned once the
/// whole query checked out, so a failing request leaves the store untouched.
///
/// `default_pmin`/`default_pmax` are the origin server's object defaults,
/// used for the `pmin <= pmax` cross-check when one side is unset.
pub fn apply_query(
    existing: &NotificationAttributes,
    pairs: &[(String, String)],
    default_pmin: i64,
    default_pmax: i64,
) -> Result<AttributeUpdate, ResultCode> {
    let mut updated = *existing;
    let mut cancel = false;

    for (key, value) in pairs {
        let key: AttributeKey = key.parse().map_err(|_| ResultCode::BadRequest)?;
        // An empty value clears the attribute at this level.
        let cleared = value.is_empty();

        match key {
            AttributeKey::Cancel => cancel = true,
            AttributeKey::MinimumPeriod | AttributeKey::MaximumPeriod => {
                let parsed = if cleared {
                    None
                } else {
                    Some(value.parse::<i64>().map_err(|_| ResultCode::BadRequest)?)
                };
                match key {
                    AttributeKey::MinimumPeriod => updated.pmin = parsed,
                    _ => updated.pmax = parsed,
                }
            }
            AttributeKey::GreaterThan | AttributeKey::LessThan | AttributeKey::Step => {
                let parsed = if cleared {
                    None
                } else {
                    Some(value.parse::<f64>().map_err(|_| ResultCode::BadRequest)?)
                };
                match key {
                    AttributeKey::GreaterThan => updated.gt = parsed,
                    AttributeKey::LessThan => updated.lt = parsed,
                    _ => updated.stp = parsed,
                }
            }
        }
    }

    let pmin = updated.pmin.unwrap_or(default_pmin);
    let pmax = updated.pmax.unwrap_or(default_pmax);
    if pmax > 0 && pmin > pmax {
        return Err(ResultCode::BadRequest);
    }
    if let (Some(gt), Some(lt), Some(stp)) = (updated.gt, updated.lt, updated.stp) {
        if lt + 2.0 * stp >= gt {
            return Err(ResultCode::BadRequest);
        }
    }

    Ok(AttributeUpdate {
        attributes: updated,
        cancel,
    })
}

#[derive(Debug, Default)]
pub struct AttributeStore {
    entries: HashMap<(u16, Path), NotificationAttributes>,
}

impl AttributeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, server: u16, path: Path, attributes: NotificationAttributes) {
        self.entries.insert((server, path), attributes);
    }

    pub fn get(&self, server: u16, path: &Path) -> NotificationAttributes {
        self.entries
            .get(&(server, *path))
            .copied()
            .unwrap_or_default()
    }

    /// Merge every level from the path itself up to its object, most
    /// specific first.
    pub fn effective(&self, server: u16, path: &Path) -> NotificationAttributes {
        let mut merged = NotificationAttributes::default();
        let mut current = Some(*path);
        while let Some(level) = current {
            if level.object.is_none() {
                break;
            }
            merged = merged.merged_over(self.get(server, &level));
            current = level.parent();
        }
        merged
    }

    /// Drop every entry under `path`, for any server. Used on delete.
    pub fn remove_subtree(&mut self, path: &Path) {
        self.entries.retain(|(_, entry), _| !path.covers(entry));
    }
}
