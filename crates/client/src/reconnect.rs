//! Reconnect controller
//!
//! One thread per client walks the set of failed topics and drives each
//! subscription back to steady state: retry the current site, follow
//! leader redirects, fall back to server-announced HA peers, or rotate
//! through the user's backup sites. Subscriptions whose very first
//! subscribe failed wait in a separate queue so their first retry follows
//! the backup-site rotation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::core::StreamingCore;
use crate::error::SessionError;
use crate::registry::SubscribeInfo;
use crate::session::Site;

/// Loop slack between sweeps
const SWEEP_INTERVAL: Duration = Duration::from_millis(10);

/// Attempts against the current address when no backup list exists
const RETRIES_WITHOUT_BACKUPS: usize = 3;

/// Attempts per site when rotating through backup sites
const RETRIES_PER_SITE: usize = 2;

struct ReconnectEntry {
    last_try: Instant,
    attempts: u64,
}

/// Shared state between parser workers (producers) and the controller
pub(crate) struct ReconnectState {
    entries: Mutex<HashMap<String, ReconnectEntry>>,
    initial: Mutex<VecDeque<SubscribeInfo>>,
}

impl ReconnectState {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            initial: Mutex::new(VecDeque::new()),
        }
    }

    /// Mark a topic as failed; the controller retries after the
    /// subscription's resub timeout.
    pub fn schedule(&self, topic: &str) {
        self.entries
            .lock()
            .entry(topic.to_owned())
            .or_insert(ReconnectEntry {
                last_try: Instant::now(),
                attempts: 0,
            });
    }

    /// Clear a topic (its schema frame arrived; handshake complete)
    pub fn clear(&self, topic: &str) {
        self.entries.lock().remove(topic);
    }

    /// Queue a subscription whose initial subscribe failed
    pub fn push_initial(&self, info: SubscribeInfo) {
        self.initial.lock().push_back(info);
    }
}

/// Controller thread body
pub(crate) fn run(core: Arc<StreamingCore>) {
    debug!("reconnect controller starting");
    while !core.is_exit() {
        sweep_failed(&core);
        if core.is_exit() {
            break;
        }
        sweep_initial(&core);
        std::thread::sleep(SWEEP_INTERVAL);
    }
    debug!("reconnect controller stopping");
}

/// One attempt: connect, negotiate, publish, and commit the registry
/// bookkeeping — all under the ready lock so the new stream's first
/// frames cannot outrun the registry update.
///
/// `rotation_idx` names the backup-rotation slot that served the attempt,
/// for the sub-once bookkeeping. The registry entry moves when the server
/// assigned a new topic name, preserving the offset either way.
fn try_resubscribe(
    core: &Arc<StreamingCore>,
    site: &Site,
    old_topic: &str,
    info: &mut SubscribeInfo,
    rotation_idx: Option<usize>,
) -> Result<String, SessionError> {
    core.metrics.resub_attempt();
    let session = core.connect_session(&site.host, site.port)?;
    let _ready = core.ready.lock();
    let new_topic = core.subscribe_with_session(session, info)?;
    if let Some(idx) = rotation_idx {
        info.update_by_reconnect(idx);
    }
    if new_topic == old_topic {
        core.registry
            .update_info(old_topic, |existing| *existing = info.clone());
    } else {
        info!(old_topic, new_topic = %new_topic, "re-subscribed under a new topic");
        core.registry.rename(old_topic, &new_topic, info.clone());
        core.reconnect.entries.lock().remove(old_topic);
    }
    core.metrics.resub_success();
    Ok(new_topic)
}

fn sweep_failed(core: &Arc<StreamingCore>) {
    let topics: Vec<String> = core.reconnect.entries.lock().keys().cloned().collect();

    for topic in topics {
        if core.is_exit() {
            return;
        }
        let Some(mut info) = core.registry.find(&topic) else {
            // Renamed or unsubscribed since the failure was recorded
            core.reconnect.entries.lock().remove(&topic);
            continue;
        };
        if !info.resub {
            continue;
        }
        let due = match core.reconnect.entries.lock().get(&topic) {
            Some(entry) => entry.last_try.elapsed() > info.resub_timeout,
            None => false,
        };
        if !due {
            continue;
        }

        if info.available_sites.is_empty() {
            retry_current_site(core, &topic, &mut info);
        } else {
            retry_backup_rotation(core, &topic, &mut info);
        }

        if let Some(entry) = core.reconnect.entries.lock().get_mut(&topic) {
            entry.last_try = Instant::now();
        }
    }
}

/// No backup list: retry the current address, following leader redirects
/// and falling back to a random server-announced HA peer on failure.
fn retry_current_site(core: &Arc<StreamingCore>, topic: &str, info: &mut SubscribeInfo) {
    for _ in 0..RETRIES_WITHOUT_BACKUPS {
        if core.is_exit() {
            return;
        }
        let site = Site::new(info.host.clone(), info.port);
        match try_resubscribe(core, &site, topic, info, None) {
            Ok(_) => return,
            Err(err) => {
                let attempt = bump_attempts(core, topic);
                if let Some(leader) = err.redirect() {
                    info!(topic, %leader, "redirected to leader for re-subscription");
                    core.ha_routes.record(
                        Site::new(info.host.clone(), info.port),
                        &info.table,
                        &info.action,
                        leader.clone(),
                    );
                    info.host = leader.host;
                    info.port = leader.port;
                } else if !info.ha_sites.is_empty() {
                    let pick = rand::thread_rng().gen_range(0..info.ha_sites.len());
                    let next = info.ha_sites[pick].clone();
                    warn!(topic, attempt, err = %err, retry_site = %next, "re-subscribe failed, trying HA peer");
                    info.host = next.host;
                    info.port = next.port;
                } else {
                    warn!(topic, attempt, err = %err, "re-subscribe failed");
                }
            }
        }
    }
}

/// Backup list present: iterate the sites round-robin, trying each twice,
/// starting at the current rotation cursor.
fn retry_backup_rotation(core: &Arc<StreamingCore>, topic: &str, info: &mut SubscribeInfo) {
    if info.last_site_idx.is_none() {
        info.last_site_idx = info.current_site_idx;
    }
    let site_count = info.available_sites.len();
    let mut current = info.current_site_idx.unwrap_or(0).min(site_count - 1);

    for _ in 0..site_count {
        info.current_site_idx = Some(current);
        let site = info.available_sites[current].clone();
        info.host = site.host.clone();
        info.port = site.port;
        core.registry.update_info(topic, |existing| *existing = info.clone());

        for _ in 0..RETRIES_PER_SITE {
            if core.is_exit() {
                return;
            }
            match try_resubscribe(core, &site, topic, info, Some(current)) {
                Ok(_) => return,
                Err(err) => {
                    let attempt = bump_attempts(core, topic);
                    warn!(topic, attempt, site = %site, err = %err, "re-subscribe failed");
                }
            }
        }
        current = (current + 1) % site_count;
    }

    // Every site failed; restart the rotation from the top next sweep
    info.current_site_idx = Some(0);
    core.registry
        .update_info(topic, |existing| existing.current_site_idx = Some(0));
}

/// Initial-subscribe failures: first retry follows the backup rotation
/// before the topic ever reaches the steady-state path.
fn sweep_initial(core: &Arc<StreamingCore>) {
    let pending: Vec<SubscribeInfo> = {
        let mut initial = core.reconnect.initial.lock();
        initial.drain(..).collect()
    };
    if pending.is_empty() {
        return;
    }

    let mut requeue = Vec::new();
    for mut info in pending {
        if core.is_exit() {
            return;
        }
        // Unsubscribed while still pending
        if info.stopped.load(Ordering::Acquire) {
            debug!(id = %info.id, "dropping stopped pending subscription");
            continue;
        }

        if !info.available_sites.is_empty() {
            let len = info.available_sites.len();
            let next = (info.current_site_idx.unwrap_or(0) + 1) % len;
            info.current_site_idx = Some(next);
            info.host = info.available_sites[next].host.clone();
            info.port = info.available_sites[next].port;
        }

        let site = Site::new(info.host.clone(), info.port);
        // The placeholder registration sits under the subscription identity
        let placeholder = info.id.clone();
        match try_resubscribe(core, &site, &placeholder, &mut info, None) {
            Ok(topic) => {
                info!(topic = %topic, id = %placeholder, "initial subscribe recovered");
            }
            Err(err) => {
                if info.available_sites.is_empty() {
                    if let Some(leader) = err.redirect() {
                        info!(id = %info.id, %leader, "redirected to leader for initial subscribe");
                        core.ha_routes.record(
                            Site::new(info.host.clone(), info.port),
                            &info.table,
                            &info.action,
                            leader.clone(),
                        );
                        info.host = leader.host;
                        info.port = leader.port;
                    } else {
                        warn!(id = %info.id, err = %err, "initial subscribe retry failed");
                    }
                } else {
                    warn!(id = %info.id, err = %err, "initial subscribe retry failed");
                }
                requeue.push(info);
            }
        }
    }

    core.reconnect.initial.lock().extend(requeue);
}

fn bump_attempts(core: &Arc<StreamingCore>, topic: &str) -> u64 {
    match core.reconnect.entries.lock().get_mut(topic) {
        Some(entry) => {
            entry.attempts += 1;
            entry.attempts
        }
        None => 0,
    }
}
