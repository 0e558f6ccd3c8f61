//! Breakpoint reconciliation.
//!
//! Breakpoints are set wholesale per source file, the way an editor reports
//! them. [`BreakpointManager::sync`] works out what changed since the last
//! sync and brings the device in line, recovering locally from breakpoints the
//! device rejects or refuses to remove.
//!
//! Three maps are kept per source path:
//!
//! - desired: what the user asked for, replaced wholesale per file
//! - system: breakpoints the client adds for itself, which survive wholesale
//!   replacement and are merged into desired automatically
//! - synced: the merged state as of the last diff

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use protocol::{ProtocolVersion, Response, ResponseBody};

use crate::error::ClientError;
use crate::events::{ClientEvent, EventBus};

/// A breakpoint as the user (or editor) describes it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceBreakpoint {
    pub line: u32,
    pub column: u32,
    pub condition: Option<String>,
    /// Number of hits to ignore before stopping.
    pub hit_count: u32,
    /// Component library the file belongs to, for `lib:/` addressing.
    pub component_library: Option<String>,
}

impl SourceBreakpoint {
    pub fn at_line(line: u32) -> Self {
        Self {
            line,
            ..Default::default()
        }
    }
}

/// A breakpoint tracked by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Local id, stable for as long as the breakpoint is unchanged.
    pub id: u32,
    pub src_path: String,
    pub line: u32,
    pub column: u32,
    pub condition: Option<String>,
    pub hit_count: u32,
    pub component_library: Option<String>,
    pub is_system: bool,
}

impl Breakpoint {
    /// Sort key used to compare breakpoints across syncs. Any edit that has
    /// to reach the device changes the key.
    pub fn key(&self) -> String {
        format!(
            "{:08}.{:08}|{}|{}",
            self.line,
            self.column,
            self.condition.as_deref().unwrap_or_default(),
            self.hit_count
        )
    }

    fn has_condition(&self) -> bool {
        self.condition.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Not yet acknowledged by the device.
    Pending,
    /// Added; waiting for the device to verify it.
    Sent,
    Verified,
    /// The device refused to remove it, so it is live again.
    Resurrected,
    Deleted,
}

/// Device-side view of a local breakpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceBreakpoint {
    pub local_id: u32,
    /// Only known after a successful add response.
    pub device_id: Option<u32>,
    pub status: SyncStatus,
}

/// Where a breakpoint lives on the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceLocation {
    pub file_path: String,
    pub line: u32,
}

/// Maps source breakpoints to device locations.
pub trait SourceLocator: Send + Sync {
    fn device_location(&self, breakpoint: &Breakpoint) -> DeviceLocation;
}

/// Uses the source path and line unchanged.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughLocator;

impl SourceLocator for PassthroughLocator {
    fn device_location(&self, breakpoint: &Breakpoint) -> DeviceLocation {
        DeviceLocation {
            file_path: breakpoint.src_path.clone(),
            line: breakpoint.line,
        }
    }
}

/// One breakpoint as sent in an add request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointTarget {
    pub file_path: String,
    pub line: u32,
    pub ignore_count: u32,
    pub condition: Option<String>,
    pub component_library: Option<String>,
}

/// The requests the manager needs from a connected device.
pub trait BreakpointRequests: Send + Sync {
    /// `None` until the handshake has completed.
    fn protocol_version(&self) -> Option<ProtocolVersion>;

    fn add_breakpoints(
        &self,
        breakpoints: Vec<BreakpointTarget>,
    ) -> impl Future<Output = Result<Response, ClientError>> + Send;

    fn remove_breakpoints(
        &self,
        breakpoint_ids: Vec<u32>,
    ) -> impl Future<Output = Result<Response, ClientError>> + Send;
}

/// Result of comparing the merged desired state to the last synced state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BreakpointDiff {
    pub added: Vec<Breakpoint>,
    pub removed: Vec<Breakpoint>,
}

impl BreakpointDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// What one sync did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub added: Vec<Breakpoint>,
    pub rejected: Vec<Breakpoint>,
    pub removed: Vec<Breakpoint>,
    pub resurrected: Vec<Breakpoint>,
}

struct Tracked {
    breakpoint: Breakpoint,
    device: DeviceBreakpoint,
}

type ByPath = BTreeMap<String, Vec<Breakpoint>>;

#[derive(Default)]
struct State {
    desired: ByPath,
    system: ByPath,
    synced: ByPath,
    tracked: HashMap<u32, Tracked>,
    ids: HashMap<(String, String), u32>,
    next_id: u32,
}

impl State {
    fn breakpoint_id(&mut self, src_path: &str, key: String) -> u32 {
        let next = &mut self.next_id;
        *self
            .ids
            .entry((src_path.to_string(), key))
            .or_insert_with(|| {
                *next += 1;
                *next
            })
    }

    fn make_breakpoint(&mut self, src_path: &str, bp: SourceBreakpoint, is_system: bool) -> Breakpoint {
        let mut breakpoint = Breakpoint {
            id: 0,
            src_path: src_path.to_string(),
            line: bp.line,
            column: bp.column,
            condition: bp.condition,
            hit_count: bp.hit_count,
            component_library: bp.component_library,
            is_system,
        };
        breakpoint.id = self.breakpoint_id(src_path, breakpoint.key());
        breakpoint
    }

    fn merged(&self) -> ByPath {
        let mut merged = self.desired.clone();
        for (path, bps) in &self.system {
            let entry = merged.entry(path.clone()).or_default();
            for bp in bps {
                if !entry.iter().any(|b| b.key() == bp.key()) {
                    entry.push(bp.clone());
                }
            }
        }
        merged.retain(|_, bps| !bps.is_empty());
        merged
    }

    fn is_live(&self, bp: &Breakpoint) -> bool {
        let map = if bp.is_system { &self.system } else { &self.desired };
        map.get(&bp.src_path)
            .is_some_and(|bps| bps.iter().any(|b| b.id == bp.id))
    }

    fn drop_from(map: &mut ByPath, bp: &Breakpoint) {
        if let Some(bps) = map.get_mut(&bp.src_path) {
            bps.retain(|b| b.id != bp.id);
            if bps.is_empty() {
                map.remove(&bp.src_path);
            }
        }
    }

    fn insert_into(map: &mut ByPath, bp: &Breakpoint) {
        let bps = map.entry(bp.src_path.clone()).or_default();
        if !bps.iter().any(|b| b.id == bp.id) {
            bps.push(bp.clone());
        }
    }

    /// Forget a breakpoint everywhere.
    fn delete(&mut self, bp: &Breakpoint) {
        Self::drop_from(&mut self.desired, bp);
        Self::drop_from(&mut self.system, bp);
        Self::drop_from(&mut self.synced, bp);
        self.tracked.remove(&bp.id);
    }

    fn resurrect(&mut self, bp: &Breakpoint) {
        if bp.is_system {
            Self::insert_into(&mut self.system, bp);
        } else {
            Self::insert_into(&mut self.desired, bp);
        }
        Self::insert_into(&mut self.synced, bp);
        if let Some(tracked) = self.tracked.get_mut(&bp.id) {
            tracked.device.status = SyncStatus::Resurrected;
        }
    }
}

/// Reconciles desired breakpoints with the device.
pub struct BreakpointManager {
    state: Mutex<State>,
    sync_lock: tokio::sync::Mutex<()>,
    locator: Arc<dyn SourceLocator>,
    events: EventBus,
}

impl std::fmt::Debug for BreakpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakpointManager").finish_non_exhaustive()
    }
}

impl BreakpointManager {
    pub fn new(events: EventBus) -> Self {
        Self::with_locator(events, Arc::new(PassthroughLocator))
    }

    pub fn with_locator(events: EventBus, locator: Arc<dyn SourceLocator>) -> Self {
        Self {
            state: Mutex::new(State::default()),
            sync_lock: tokio::sync::Mutex::new(()),
            locator,
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace every desired breakpoint in `src_path`.
    pub fn set_breakpoints(
        &self,
        src_path: &str,
        breakpoints: Vec<SourceBreakpoint>,
    ) -> Vec<Breakpoint> {
        let mut state = self.lock();
        let mut replaced: Vec<Breakpoint> = Vec::with_capacity(breakpoints.len());
        for bp in breakpoints {
            let bp = state.make_breakpoint(src_path, bp, false);
            if !replaced.iter().any(|b| b.id == bp.id) {
                replaced.push(bp);
            }
        }
        if replaced.is_empty() {
            state.desired.remove(src_path);
        } else {
            state.desired.insert(src_path.to_string(), replaced.clone());
        }
        replaced
    }

    pub fn add_system_breakpoint(&self, src_path: &str, breakpoint: SourceBreakpoint) -> Breakpoint {
        let mut state = self.lock();
        let bp = state.make_breakpoint(src_path, breakpoint, true);
        State::insert_into(&mut state.system, &bp);
        bp
    }

    pub fn remove_system_breakpoint(&self, id: u32) -> bool {
        let mut state = self.lock();
        let found = state
            .system
            .values()
            .flatten()
            .find(|b| b.id == id)
            .cloned();
        match found {
            Some(bp) => {
                State::drop_from(&mut state.system, &bp);
                true
            }
            None => false,
        }
    }

    /// Desired and system breakpoints, merged.
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.lock().merged().into_values().flatten().collect()
    }

    pub fn device_state(&self, id: u32) -> Option<DeviceBreakpoint> {
        self.lock().tracked.get(&id).map(|t| t.device)
    }

    /// Compare merged desired state with the last synced state and record the
    /// merged state as synced.
    pub fn diff(&self) -> BreakpointDiff {
        let mut state = self.lock();
        let merged = state.merged();
        let mut diff = BreakpointDiff::default();

        for (path, bps) in &merged {
            let synced = state.synced.get(path);
            for bp in bps {
                if !synced.is_some_and(|s| s.iter().any(|b| b.key() == bp.key())) {
                    diff.added.push(bp.clone());
                }
            }
        }
        for (path, bps) in &state.synced {
            let current = merged.get(path);
            for bp in bps {
                if !current.is_some_and(|m| m.iter().any(|b| b.key() == bp.key())) {
                    diff.removed.push(bp.clone());
                }
            }
        }

        state.synced = merged;
        diff
    }

    /// Bring the device in line with the desired breakpoints.
    ///
    /// Syncs are serialized. Breakpoints the device rejects are dropped from
    /// the desired state; breakpoints it refuses to remove are reinstated.
    #[tracing::instrument(skip_all)]
    pub async fn sync<D: BreakpointRequests>(&self, device: &D) -> Result<SyncReport, ClientError> {
        let _guard = self.sync_lock.lock().await;
        let version = device
            .protocol_version()
            .ok_or(ClientError::HandshakeIncomplete)?;

        let diff = self.diff();
        if diff.is_empty() {
            return Ok(SyncReport::default());
        }
        tracing::debug!(added = diff.added.len(), removed = diff.removed.len(), "syncing breakpoints");

        let mut report = SyncReport::default();
        let mut verified = Vec::new();

        let (conditional, plain): (Vec<_>, Vec<_>) = diff
            .added
            .into_iter()
            .partition(|bp| version.supports_conditional_breakpoints() && bp.has_condition());
        {
            let mut state = self.lock();
            for bp in plain.iter().chain(&conditional) {
                state.tracked.insert(
                    bp.id,
                    Tracked {
                        breakpoint: bp.clone(),
                        device: DeviceBreakpoint {
                            local_id: bp.id,
                            device_id: None,
                            status: SyncStatus::Pending,
                        },
                    },
                );
            }
        }
        for batch in [plain, conditional] {
            if !batch.is_empty() {
                self.add_batch(device, version, batch, &mut report, &mut verified)
                    .await;
            }
        }

        if !diff.removed.is_empty() {
            self.remove_batch(device, diff.removed, &mut report).await;
        }

        if !verified.is_empty() {
            self.events.emit(ClientEvent::BreakpointsVerified(verified));
        }
        if !report.resurrected.is_empty() {
            self.events
                .emit(ClientEvent::BreakpointsResurrected(report.resurrected.clone()));
        }
        Ok(report)
    }

    fn target_for(&self, bp: &Breakpoint) -> BreakpointTarget {
        let location = self.locator.device_location(bp);
        BreakpointTarget {
            file_path: location.file_path,
            line: location.line,
            ignore_count: bp.hit_count,
            condition: bp.condition.clone(),
            component_library: bp.component_library.clone(),
        }
    }

    async fn add_batch<D: BreakpointRequests>(
        &self,
        device: &D,
        version: ProtocolVersion,
        batch: Vec<Breakpoint>,
        report: &mut SyncReport,
        verified: &mut Vec<Breakpoint>,
    ) {
        let targets = batch.iter().map(|bp| self.target_for(bp)).collect();
        let infos = match device.add_breakpoints(targets).await {
            Ok(Response {
                error_code,
                body: ResponseBody::Breakpoints(body),
                ..
            }) if error_code.is_ok() => body.breakpoints,
            Ok(response) => {
                tracing::warn!(error_code = %response.error_code, "device rejected breakpoint batch");
                self.retry_later(&batch);
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to add breakpoints");
                self.retry_later(&batch);
                return;
            }
        };

        let mut state = self.lock();
        for (index, bp) in batch.into_iter().enumerate() {
            let Some(info) = infos.get(index) else {
                tracing::warn!(id = bp.id, "no answer for breakpoint, will retry");
                State::drop_from(&mut state.synced, &bp);
                state.tracked.remove(&bp.id);
                continue;
            };
            if !info.error_code.is_ok() {
                tracing::info!(id = bp.id, error_code = %info.error_code, "device rejected breakpoint");
                state.delete(&bp);
                report.rejected.push(bp);
                continue;
            }
            if !state.is_live(&bp) {
                // deleted while the add was in flight
                tracing::debug!(id = bp.id, device_id = info.breakpoint_id, "discarding breakpoint");
                State::drop_from(&mut state.synced, &bp);
                state.tracked.remove(&bp.id);
                continue;
            }
            if let Some(tracked) = state.tracked.get_mut(&bp.id) {
                tracked.device.device_id = Some(info.breakpoint_id);
                if version.supports_breakpoint_verification() {
                    tracked.device.status = SyncStatus::Sent;
                } else {
                    tracked.device.status = SyncStatus::Verified;
                    verified.push(bp.clone());
                }
            }
            report.added.push(bp);
        }
    }

    /// Forget that a batch was synced, so the next sync sends it again.
    fn retry_later(&self, batch: &[Breakpoint]) {
        let mut state = self.lock();
        for bp in batch {
            State::drop_from(&mut state.synced, bp);
            state.tracked.remove(&bp.id);
        }
    }

    async fn remove_batch<D: BreakpointRequests>(
        &self,
        device: &D,
        removed: Vec<Breakpoint>,
        report: &mut SyncReport,
    ) {
        let mut to_remove: Vec<(Breakpoint, u32)> = Vec::new();
        {
            let mut state = self.lock();
            for bp in removed {
                match state.tracked.get_mut(&bp.id) {
                    Some(tracked) => match tracked.device.device_id {
                        Some(device_id) => {
                            tracked.device.status = SyncStatus::Deleted;
                            to_remove.push((bp, device_id));
                        }
                        None => {
                            state.tracked.remove(&bp.id);
                        }
                    },
                    None => tracing::debug!(id = bp.id, "breakpoint never reached the device"),
                }
            }
        }
        if to_remove.is_empty() {
            return;
        }

        let ids: Vec<u32> = to_remove.iter().map(|(_, id)| *id).collect();
        let failed_ids: Vec<u32> = match device.remove_breakpoints(ids.clone()).await {
            Ok(Response {
                error_code,
                body: ResponseBody::Breakpoints(body),
                ..
            }) if error_code.is_ok() => body
                .breakpoints
                .iter()
                .filter(|info| !info.error_code.is_ok())
                .map(|info| info.breakpoint_id)
                .collect(),
            Ok(response) if response.error_code.is_ok() => Vec::new(),
            Ok(response) => {
                tracing::warn!(error_code = %response.error_code, "device refused to remove breakpoints");
                ids
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to remove breakpoints");
                ids
            }
        };

        let mut state = self.lock();
        for (bp, device_id) in to_remove {
            if failed_ids.contains(&device_id) {
                tracing::info!(id = bp.id, device_id, "resurrecting breakpoint");
                state.resurrect(&bp);
                report.resurrected.push(bp);
            } else {
                state.tracked.remove(&bp.id);
                report.removed.push(bp);
            }
        }
    }

    /// Handle a `BreakpointVerified` update.
    ///
    /// Ids the client no longer knows about belong to breakpoints deleted
    /// while their add was in flight; they are removed from the device.
    #[tracing::instrument(skip(self, device))]
    pub async fn handle_verified<D: BreakpointRequests>(
        &self,
        device: &D,
        device_ids: &[u32],
    ) -> Result<(), ClientError> {
        let _guard = self.sync_lock.lock().await;
        let mut verified = Vec::new();
        let mut unknown = Vec::new();
        {
            let mut state = self.lock();
            for &device_id in device_ids {
                let tracked = state
                    .tracked
                    .values_mut()
                    .find(|t| t.device.device_id == Some(device_id));
                match tracked {
                    Some(tracked) => {
                        tracked.device.status = SyncStatus::Verified;
                        verified.push(tracked.breakpoint.clone());
                    }
                    None => unknown.push(device_id),
                }
            }
        }

        if !verified.is_empty() {
            self.events.emit(ClientEvent::BreakpointsVerified(verified));
        }
        if !unknown.is_empty() {
            tracing::info!(?unknown, "removing breakpoints the client no longer tracks");
            let response = device.remove_breakpoints(unknown).await?;
            if !response.error_code.is_ok() {
                tracing::warn!(error_code = %response.error_code, "failed to remove untracked breakpoints");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{BreakpointInfo, BreakpointsResponse, ErrorCode};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use tokio::sync::{Notify, oneshot};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        Add(Vec<BreakpointTarget>),
        Remove(Vec<u32>),
    }

    enum RemoveMode {
        Ok,
        FailAll,
        FailIds(Vec<u32>),
    }

    struct FakeDevice {
        version: ProtocolVersion,
        next_device_id: AtomicU32,
        reject_lines: Vec<u32>,
        add_error: Option<ErrorCode>,
        remove_mode: Mutex<RemoveMode>,
        calls: Mutex<Vec<Call>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        add_entered: Notify,
        add_gates: Mutex<VecDeque<oneshot::Receiver<()>>>,
    }

    impl FakeDevice {
        fn new(version: ProtocolVersion) -> Self {
            Self {
                version,
                next_device_id: AtomicU32::new(100),
                reject_lines: Vec::new(),
                add_error: None,
                remove_mode: Mutex::new(RemoveMode::Ok),
                calls: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                add_entered: Notify::new(),
                add_gates: Mutex::new(VecDeque::new()),
            }
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }

        fn removes(&self) -> Vec<Vec<u32>> {
            self.calls()
                .into_iter()
                .filter_map(|c| match c {
                    Call::Remove(ids) => Some(ids),
                    Call::Add(_) => None,
                })
                .collect()
        }

        fn enter(&self) {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        }

        fn leave(&self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl BreakpointRequests for FakeDevice {
        fn protocol_version(&self) -> Option<ProtocolVersion> {
            Some(self.version)
        }

        async fn add_breakpoints(
            &self,
            breakpoints: Vec<BreakpointTarget>,
        ) -> Result<Response, ClientError> {
            self.enter();
            self.calls.lock().unwrap().push(Call::Add(breakpoints.clone()));
            self.add_entered.notify_one();
            let gate = self.add_gates.lock().unwrap().pop_front();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            self.leave();

            if let Some(code) = self.add_error {
                return Ok(Response::error(1, code));
            }
            let breakpoints = breakpoints
                .iter()
                .map(|target| {
                    let breakpoint_id = self.next_device_id.fetch_add(1, Ordering::SeqCst);
                    if self.reject_lines.contains(&target.line) {
                        BreakpointInfo {
                            breakpoint_id,
                            error_code: ErrorCode::InvalidArgs,
                            ignore_count: None,
                        }
                    } else {
                        BreakpointInfo {
                            breakpoint_id,
                            error_code: ErrorCode::Ok,
                            ignore_count: Some(target.ignore_count),
                        }
                    }
                })
                .collect();
            Ok(Response::ok(
                1,
                ResponseBody::Breakpoints(BreakpointsResponse { breakpoints }),
            ))
        }

        async fn remove_breakpoints(&self, breakpoint_ids: Vec<u32>) -> Result<Response, ClientError> {
            self.enter();
            self.calls
                .lock()
                .unwrap()
                .push(Call::Remove(breakpoint_ids.clone()));
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            self.leave();

            let failed: Vec<u32> = match &*self.remove_mode.lock().unwrap() {
                RemoveMode::Ok => Vec::new(),
                RemoveMode::FailAll => return Ok(Response::error(2, ErrorCode::InvalidArgs)),
                RemoveMode::FailIds(ids) => ids.clone(),
            };
            let breakpoints = breakpoint_ids
                .into_iter()
                .map(|breakpoint_id| {
                    if failed.contains(&breakpoint_id) {
                        BreakpointInfo {
                            breakpoint_id,
                            error_code: ErrorCode::InvalidArgs,
                            ignore_count: None,
                        }
                    } else {
                        BreakpointInfo {
                            breakpoint_id,
                            error_code: ErrorCode::Ok,
                            ignore_count: Some(0),
                        }
                    }
                })
                .collect();
            Ok(Response::ok(
                2,
                ResponseBody::Breakpoints(BreakpointsResponse { breakpoints }),
            ))
        }
    }

    const MAIN: &str = "pkg:/source/main.brs";

    fn lines(lines: &[u32]) -> Vec<SourceBreakpoint> {
        lines.iter().map(|l| SourceBreakpoint::at_line(*l)).collect()
    }

    fn device_id(manager: &BreakpointManager, bp: &Breakpoint) -> u32 {
        manager.device_state(bp.id).unwrap().device_id.unwrap()
    }

    #[test]
    fn diff_twice_is_empty_the_second_time() {
        let manager = BreakpointManager::new(EventBus::new());
        manager.set_breakpoints(MAIN, lines(&[1, 2]));
        manager.add_system_breakpoint("pkg:/source/lib.brs", SourceBreakpoint::at_line(9));

        let first = manager.diff();
        assert_eq!(first.added.len(), 3);
        assert!(first.removed.is_empty());
        assert!(manager.diff().is_empty());
    }

    #[test]
    fn ids_are_stable_and_edits_change_the_key() {
        let manager = BreakpointManager::new(EventBus::new());
        let first = manager.set_breakpoints(MAIN, lines(&[4]));
        let again = manager.set_breakpoints(MAIN, lines(&[4]));
        assert_eq!(first[0].id, again[0].id);
        manager.diff();

        let edited = manager.set_breakpoints(
            MAIN,
            vec![SourceBreakpoint {
                line: 4,
                condition: Some("x > 1".into()),
                ..Default::default()
            }],
        );
        assert_ne!(edited[0].id, first[0].id);
        let diff = manager.diff();
        assert_eq!(diff.added, edited);
        assert_eq!(diff.removed, first);
    }

    #[test]
    fn system_breakpoints_survive_wholesale_replacement() {
        let manager = BreakpointManager::new(EventBus::new());
        let system = manager.add_system_breakpoint(MAIN, SourceBreakpoint::at_line(1));
        manager.set_breakpoints(MAIN, lines(&[2]));
        manager.set_breakpoints(MAIN, Vec::new());

        assert_eq!(manager.breakpoints(), vec![system.clone()]);
        assert!(manager.remove_system_breakpoint(system.id));
        assert!(manager.breakpoints().is_empty());
    }

    #[tokio::test]
    async fn sync_adds_and_verifies_on_old_devices() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let manager = BreakpointManager::new(events);
        let device = FakeDevice::new(ProtocolVersion::V3_1_0);
        let bps = manager.set_breakpoints(MAIN, lines(&[3, 5]));

        let report = manager.sync(&device).await.unwrap();
        assert_eq!(report.added, bps);
        for bp in &bps {
            assert_eq!(manager.device_state(bp.id).unwrap().status, SyncStatus::Verified);
        }
        assert_eq!(rx.recv().await, Some(ClientEvent::BreakpointsVerified(bps)));

        // nothing changed
        assert_eq!(manager.sync(&device).await.unwrap(), SyncReport::default());
        assert_eq!(device.calls().len(), 1);
    }

    #[tokio::test]
    async fn conditional_breakpoints_go_in_their_own_batch() {
        let manager = BreakpointManager::new(EventBus::new());
        let device = FakeDevice::new(ProtocolVersion::V3_1_0);
        manager.set_breakpoints(
            MAIN,
            vec![
                SourceBreakpoint::at_line(1),
                SourceBreakpoint {
                    line: 2,
                    condition: Some("a = 1".into()),
                    ..Default::default()
                },
            ],
        );
        manager.sync(&device).await.unwrap();

        let calls = device.calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0], Call::Add(targets) if targets.len() == 1 && targets[0].condition.is_none()));
        assert!(matches!(&calls[1], Call::Add(targets) if targets[0].condition.as_deref() == Some("a = 1")));
    }

    #[tokio::test]
    async fn new_devices_wait_for_verification() {
        let events = EventBus::new();
        let mut rx = events.subscribe();
        let manager = BreakpointManager::new(events);
        let device = FakeDevice::new(ProtocolVersion::V3_2_0);
        let bps = manager.set_breakpoints(MAIN, lines(&[3]));

        manager.sync(&device).await.unwrap();
        assert_eq!(manager.device_state(bps[0].id).unwrap().status, SyncStatus::Sent);

        let id = device_id(&manager, &bps[0]);
        manager.handle_verified(&device, &[id]).await.unwrap();
        assert_eq!(manager.device_state(bps[0].id).unwrap().status, SyncStatus::Verified);
        assert_eq!(rx.recv().await, Some(ClientEvent::BreakpointsVerified(bps)));
        assert!(device.removes().is_empty());
    }

    #[tokio::test]
    async fn concurrent_syncs_are_serialized() {
        let manager = Arc::new(BreakpointManager::new(EventBus::new()));
        let device = Arc::new(FakeDevice::new(ProtocolVersion::V3_1_0));

        let mut tasks = Vec::new();
        for i in 0..8u32 {
            manager.set_breakpoints(&format!("pkg:/source/file{i}.brs"), lines(&[i + 1]));
            let manager = manager.clone();
            let device = device.clone();
            tasks.push(tokio::spawn(async move { manager.sync(&*device).await }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(device.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(manager.breakpoints().len(), 8);
        assert!(manager.diff().is_empty());
    }

    #[tokio::test]
    async fn rejected_adds_are_dropped_from_desired_state() {
        let manager = BreakpointManager::new(EventBus::new());
        let mut device = FakeDevice::new(ProtocolVersion::V3_1_0);
        device.reject_lines = vec![2];
        let bps = manager.set_breakpoints(MAIN, lines(&[1, 2]));

        let report = manager.sync(&device).await.unwrap();
        assert_eq!(report.added, vec![bps[0].clone()]);
        assert_eq!(report.rejected, vec![bps[1].clone()]);
        assert_eq!(manager.breakpoints(), vec![bps[0].clone()]);
        assert!(manager.diff().is_empty());
    }

    #[tokio::test]
    async fn failed_batches_are_retried() {
        let manager = BreakpointManager::new(EventBus::new());
        let mut device = FakeDevice::new(ProtocolVersion::V3_1_0);
        device.add_error = Some(ErrorCode::OtherErr);
        let bps = manager.set_breakpoints(MAIN, lines(&[1]));

        let report = manager.sync(&device).await.unwrap();
        assert!(report.added.is_empty());
        assert_eq!(manager.breakpoints(), bps);

        let diff = manager.diff();
        assert_eq!(diff.added, bps);
    }

    #[tokio::test]
    async fn wholesale_remove_failure_resurrects_everything() {
        let events = EventBus::new();
        let manager = BreakpointManager::new(events.clone());
        let device = FakeDevice::new(ProtocolVersion::V3_1_0);
        let bps = manager.set_breakpoints(MAIN, lines(&[1, 2, 3]));
        manager.sync(&device).await.unwrap();

        *device.remove_mode.lock().unwrap() = RemoveMode::FailAll;
        let mut rx = events.subscribe();
        manager.set_breakpoints(MAIN, lines(&[2]));
        let report = manager.sync(&device).await.unwrap();

        let expected = vec![bps[0].clone(), bps[2].clone()];
        assert_eq!(report.resurrected, expected);
        assert_eq!(
            rx.recv().await,
            Some(ClientEvent::BreakpointsResurrected(expected))
        );
        let live: Vec<u32> = manager.breakpoints().iter().map(|b| b.line).collect();
        assert_eq!(live, vec![2, 1, 3]);
        for bp in [&bps[0], &bps[2]] {
            assert_eq!(manager.device_state(bp.id).unwrap().status, SyncStatus::Resurrected);
        }
        assert!(manager.diff().is_empty());
    }

    #[tokio::test]
    async fn partial_remove_failure_resurrects_only_the_failures() {
        let manager = BreakpointManager::new(EventBus::new());
        let device = FakeDevice::new(ProtocolVersion::V3_1_0);
        let bps = manager.set_breakpoints(MAIN, lines(&[1, 2, 3]));
        manager.sync(&device).await.unwrap();

        let failing = device_id(&manager, &bps[0]);
        *device.remove_mode.lock().unwrap() = RemoveMode::FailIds(vec![failing]);
        manager.set_breakpoints(MAIN, lines(&[2]));
        let report = manager.sync(&device).await.unwrap();

        assert_eq!(report.resurrected, vec![bps[0].clone()]);
        assert_eq!(report.removed, vec![bps[2].clone()]);
        let live: Vec<u32> = manager.breakpoints().iter().map(|b| b.line).collect();
        assert_eq!(live, vec![2, 1]);
        assert!(manager.device_state(bps[2].id).is_none());
    }

    #[tokio::test]
    async fn breakpoint_deleted_during_add_is_discarded_then_removed_when_verified() {
        let manager = Arc::new(BreakpointManager::new(EventBus::new()));
        let device = Arc::new(FakeDevice::new(ProtocolVersion::V3_2_0));
        let (release, gate) = oneshot::channel();
        device.add_gates.lock().unwrap().push_back(gate);

        manager.set_breakpoints(MAIN, lines(&[7]));
        let sync = {
            let manager = manager.clone();
            let device = device.clone();
            tokio::spawn(async move { manager.sync(&*device).await })
        };

        device.add_entered.notified().await;
        manager.set_breakpoints(MAIN, Vec::new());
        release.send(()).unwrap();
        let report = sync.await.unwrap().unwrap();
        assert!(report.added.is_empty());

        manager.sync(&*device).await.unwrap();
        assert!(device.removes().is_empty());

        // the device assigned id 100 to the discarded breakpoint
        manager.handle_verified(&*device, &[100]).await.unwrap();
        assert_eq!(device.removes(), vec![vec![100]]);
    }

    #[tokio::test]
    async fn sync_requires_a_handshake() {
        struct NotConnected;
        impl BreakpointRequests for NotConnected {
            fn protocol_version(&self) -> Option<ProtocolVersion> {
                None
            }
            async fn add_breakpoints(&self, _: Vec<BreakpointTarget>) -> Result<Response, ClientError> {
                Err(ClientError::NotConnected)
            }
            async fn remove_breakpoints(&self, _: Vec<u32>) -> Result<Response, ClientError> {
                Err(ClientError::NotConnected)
            }
        }

        let manager = BreakpointManager::new(EventBus::new());
        manager.set_breakpoints(MAIN, lines(&[1]));
        assert!(matches!(
            manager.sync(&NotConnected).await,
            Err(ClientError::HandshakeIncomplete)
        ));
        assert_eq!(manager.diff().added.len(), 1);
    }
}
