//! Registered observers and notification pacing.
//!
//! An observation is created by a CoAP GET carrying Observe=0 and lives
//! until a cancel, a DELETE covering its path, or the teardown of the peer
//! it belongs to. The engine reports every committed write through
//! [`ObserverList::mark_changed`]; a periodic [`ObserverList::due`] then
//! decides which observations deliver, honouring the effective notification
//! attributes:
//!
//! 1. `pmax` forces a delivery when the time since the last pmax-scheduled
//!    delivery reaches it (zero or negative disables this),
//! 2. numeric resources with any of `gt`/`lt`/`stp` set fire on threshold
//!    crossings measured against the last *sent* value,
//! 3. everything else fires when the byte representation changed,
//! 4. `pmin` defers a due delivery to the earliest permitted tick.

use std::net::SocketAddr;

use crate::attributes::NotificationAttributes;
use crate::codec::ContentType;
use crate::types::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObservationId(u64);

#[derive(Debug)]
pub struct Observation {
    pub id: ObservationId,
    pub address: SocketAddr,
    pub token: Vec<u8>,
    pub path: Path,
    pub accept: Option<ContentType>,
    pub short_server_id: u16,
    sequence: u32,
    /// When the last notification (of any cause) went out.
    last_sent_ms: u64,
    /// When the pmax period last restarted: observation start or the last
    /// pmax-scheduled delivery. A threshold/change delivery does not push
    /// the pmax schedule back.
    pmax_anchor_ms: u64,
    /// Byte image of the value as of the last delivery (resource-depth
    /// observations only).
    last_sent_bytes: Option<Vec<u8>>,
    /// Numeric image for threshold crossings.
    last_sent_numeric: Option<f64>,
    /// A change made this observation due; waiting for pmin to permit it.
    pending: bool,
}

impl Observation {
    pub fn sequence(&self) -> u32 {
        self.sequence
    }
}

/// A delivery the engine should serialize and hand to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueNotification {
    pub id: ObservationId,
    pub address: SocketAddr,
    pub token: Vec<u8>,
    pub path: Path,
    pub accept: Option<ContentType>,
    pub sequence: u32,
    /// This delivery restarts the pmax period.
    pmax_scheduled: bool,
}

#[derive(Debug, Default)]
pub struct ObserverList {
    observations: Vec<Observation>,
    next_id: u64,
}

impl ObserverList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) an observation. A second Observe from the same
    /// address on the same path replaces the first.
    #[allow(clippy::too_many_arguments)]
    pub fn observe(
        &mut self,
        address: SocketAddr,
        token: Vec<u8>,
        path: Path,
        accept: Option<ContentType>,
        short_server_id: u16,
        now_ms: u64,
        current_value: Option<(Vec<u8>, Option<f64>)>,
    ) -> ObservationId {
        self.observations
            .retain(|existing| !(existing.address == address && existing.path == path));

        let id = ObservationId(self.next_id);
        self.next_id += 1;

        let (bytes, numeric) = current_value
            .map(|(bytes, numeric)| (Some(bytes), numeric))
            .unwrap_or((None, None));

        self.observations.push(Observation {
            id,
            address,
            token,
            path,
            accept,
            short_server_id,
            sequence: 0,
            last_sent_ms: now_ms,
            pmax_anchor_ms: now_ms,
            last_sent_bytes: bytes,
            last_sent_numeric: numeric,
            pending: false,
        });
        id
    }

    pub fn get(&self, id: ObservationId) -> Option<&Observation> {
        self.observations.iter().find(|obs| obs.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.observations.iter()
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    /// Cancel the observation `address` holds on exactly `path`.
    pub fn cancel_by_path(&mut self, address: SocketAddr, path: &Path) -> bool {
        let before = self.observations.len();
        self.observations
            .retain(|obs| !(obs.address == address && obs.path == *path));
        self.observations.len() != before
    }

    pub fn cancel_by_token(&mut self, address: SocketAddr, token: &[u8]) -> bool {
        let before = self.observations.len();
        self.observations
            .retain(|obs| !(obs.address == address && obs.token == token));
        self.observations.len() != before
    }

    /// Drop every observation whose path is `path` or a descendant of it.
    /// Used when the observed node is deleted.
    pub fn cancel_covered(&mut self, path: &Path) -> usize {
        let before = self.observations.len();
        self.observations.retain(|obs| !path.covers(&obs.path));
        before - self.observations.len()
    }

    /// Drop every observation belonging to `address` (peer teardown).
    pub fn remove_for_address(&mut self, address: SocketAddr) -> usize {
        let before = self.observations.len();
        self.observations.retain(|obs| obs.address != address);
        before - self.observations.len()
    }

    /// Record a committed write at a resource path. `numeric` carries the
    /// new value for threshold evaluation when the resource type is numeric.
    pub fn mark_changed(
        &mut self,
        written: &Path,
        new_bytes: &[u8],
        numeric: Option<f64>,
        resolve: impl Fn(&Observation) -> NotificationAttributes,
    ) {
        for obs in &mut self.observations {
            if !obs.path.covers(written) {
                continue;
            }
            let effective = resolve(obs);
            let thresholds_set =
                effective.gt.is_some() || effective.lt.is_some() || effective.stp.is_some();

            let due = match (numeric, thresholds_set) {
                (Some(new), true) => {
                    let last = obs.last_sent_numeric;
                    let crossed_gt = effective.gt.is_some_and(|gt| {
                        last.is_some_and(|last| last <= gt) && new > gt
                    });
                    let crossed_lt = effective.lt.is_some_and(|lt| {
                        last.is_some_and(|last| last >= lt) && new < lt
                    });
                    let stepped = effective.stp.is_some_and(|stp| {
                        last.map_or(true, |last| (new - last).abs() >= stp)
                    });
                    crossed_gt || crossed_lt || stepped
                }
                _ => {
                    // Byte comparison; shallow observations have no cached
                    // image and treat any covered change as a change.
                    obs.last_sent_bytes.as_deref() != Some(new_bytes)
                }
            };

            if due {
                obs.pending = true;
            }
        }
    }

    /// The observations permitted to deliver at `now_ms`.
    pub fn due(
        &mut self,
        now_ms: u64,
        resolve: impl Fn(&Observation) -> NotificationAttributes,
    ) -> Vec<DueNotification> {
        let mut due = vec![];
        for obs in &mut self.observations {
            let effective = resolve(obs);
            let pmin_ms = effective.pmin.unwrap_or(0).max(0) as u64 * 1000;
            let pmax = effective.pmax.unwrap_or(0);

            let pmax_scheduled =
                pmax > 0 && now_ms.saturating_sub(obs.pmax_anchor_ms) >= pmax as u64 * 1000;

            if !(obs.pending || pmax_scheduled) {
                continue;
            }
            if now_ms.saturating_sub(obs.last_sent_ms) < pmin_ms {
                // Defer to the earliest permitted tick.
                obs.pending = true;
                continue;
            }

            obs.sequence += 1;
            due.push(DueNotification {
                id: obs.id,
                address: obs.address,
                token: obs.token.clone(),
                path: obs.path,
                accept: obs.accept,
                sequence: obs.sequence,
                pmax_scheduled,
            });
        }
        due
    }

    /// Record a completed delivery, updating the pacing state and the
    /// last-sent image.
    pub fn mark_sent(
        &mut self,
        notification: &DueNotification,
        now_ms: u64,
        sent_bytes: Option<Vec<u8>>,
        sent_numeric: Option<f64>,
    ) {
        if let Some(obs) = self
            .observations
            .iter_mut()
            .find(|obs| obs.id == notification.id)
        {
            obs.pending = false;
            obs.last_sent_ms = now_ms;
            if notification.pmax_scheduled {
                obs.pmax_anchor_ms = now_ms;
            }
            if sent_bytes.is_some() {
                obs.last_sent_bytes = sent_bytes;
            }
            if sent_numeric.is_some() {
                obs.last_sent_numeric = sent_numeric;
            }
        }
    }
}
