//! Resolution and application of registered descriptors.
//!
//! Each descriptor moves through `Pending -> Resolved -> Applied | Skipped |
//! Failed`. Descriptors are isolated from one another: whatever happens to
//! one of them, the rest of the pass continues, and a method whose patches
//! all failed is left exactly as the host shipped it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};

use tracing::{debug, info, trace, warn};

use crate::body::MethodBody;
use crate::descriptor::{PatchAction, PatchDescriptor, PatchId, PatchKind};
use crate::gate;
use crate::host::{Hook, HookFn, Host, MethodHandle, MethodInfo, Redirect};
use crate::report::{FailureReason, OutcomeSummary, PatchOutcome, PatchState, SkipReason};
use crate::session::ApplicationSession;

/// A descriptor whose target was found and whose gate is open.
struct Resolved {
    order: usize,
    descriptor: PatchDescriptor,
}

impl Resolved {
    fn sort_key(&self) -> (i32, usize) {
        (self.descriptor.priority, self.order)
    }
}

/// Outcomes of one pass, kept in registration order.
struct PassLog {
    entries: Vec<(usize, PatchOutcome)>,
    applied: Vec<PatchId>,
}

impl PassLog {
    fn new() -> Self {
        PassLog {
            entries: Vec::new(),
            applied: Vec::new(),
        }
    }

    fn push(&mut self, order: usize, descriptor: &PatchDescriptor, state: PatchState) {
        match &state {
            PatchState::Applied => {
                debug!(patch = %descriptor.id, method = %descriptor.target, "applied");
                self.applied.push(descriptor.id.clone());
            }
            PatchState::Skipped { reason: SkipReason::GateClosed } => {
                trace!(patch = %descriptor.id, "gate closed, skipped");
            }
            PatchState::Skipped { reason } => {
                info!(patch = %descriptor.id, ?reason, "skipped");
            }
            PatchState::Failed { reason, detail } => {
                warn!(
                    patch = %descriptor.id,
                    method = %descriptor.target,
                    %reason,
                    %detail,
                    "patch failed"
                );
            }
        }
        self.entries.push((
            order,
            PatchOutcome {
                patch: descriptor.id.clone(),
                target: descriptor.target.clone(),
                kind: descriptor.kind(),
                state,
            },
        ));
    }

    fn fail(
        &mut self,
        order: usize,
        descriptor: &PatchDescriptor,
        reason: FailureReason,
        detail: String,
    ) {
        self.push(order, descriptor, PatchState::Failed { reason, detail });
    }

    fn skip(&mut self, order: usize, descriptor: &PatchDescriptor, reason: SkipReason) {
        self.push(order, descriptor, PatchState::Skipped { reason });
    }
}

/// Installs every descriptor registered since the previous pass.
///
/// A descriptor whose id was already applied in this session is rejected
/// with `InstallConflict` and never reaches the host, so running the same
/// registration twice cannot double any effect.
pub fn install<H: Host + ?Sized>(session: &mut ApplicationSession, host: &mut H) -> OutcomeSummary {
    let pending = session.take_pending();
    if pending.is_empty() {
        return OutcomeSummary::default();
    }

    probe_capabilities(session, &*host, &pending);
    let version = session.host_version();
    info!(%version, count = pending.len(), "installing patches");

    let mut log = PassLog::new();
    let mut seen: HashSet<PatchId> = HashSet::new();
    let mut groups: Vec<(MethodInfo, Vec<Resolved>)> = Vec::new();
    let mut group_index: HashMap<MethodHandle, usize> = HashMap::new();

    for (order, descriptor) in pending.into_iter().enumerate() {
        if session.is_installed(&descriptor.id) {
            log.fail(
                order,
                &descriptor,
                FailureReason::InstallConflict,
                "already installed in this session".to_string(),
            );
            continue;
        }
        if !seen.insert(descriptor.id.clone()) {
            log.fail(
                order,
                &descriptor,
                FailureReason::InstallConflict,
                "patch id registered more than once".to_string(),
            );
            continue;
        }
        if session.config().is_disabled(&descriptor) {
            log.skip(order, &descriptor, SkipReason::Disabled);
            continue;
        }

        let method = match host.lookup_method(&descriptor.target) {
            Some(method) => method,
            None => {
                let detail = format!("no method {} on host {}", descriptor.target, version);
                log.fail(order, &descriptor, FailureReason::TargetNotFound, detail);
                continue;
            }
        };

        if !gate::is_applicable(&descriptor, version, session.capabilities()) {
            log.skip(order, &descriptor, SkipReason::GateClosed);
            continue;
        }

        let slot = *group_index.entry(method.handle).or_insert_with(|| {
            groups.push((method.clone(), Vec::new()));
            groups.len() - 1
        });
        groups[slot].1.push(Resolved { order, descriptor });
    }

    for (method, mut members) in groups {
        members.sort_by_key(Resolved::sort_key);
        let (rewrites, redirects): (Vec<Resolved>, Vec<Resolved>) = members
            .into_iter()
            .partition(|r| !r.descriptor.kind().is_redirect());

        if !rewrites.is_empty()
            && redirects.iter().any(|r| r.descriptor.kind() == PatchKind::Replace)
        {
            warn!(
                method = %method.signature,
                "stream rewrites apply to a body that a replace patch shadows"
            );
        }

        if !rewrites.is_empty() {
            apply_rewrites(host, &method, rewrites, &mut log);
        }
        if redirects.is_empty() {
            continue;
        }
        match session.redirect_on(method.handle) {
            Some(owners) => {
                let owners: Vec<String> = owners.iter().map(PatchId::to_string).collect();
                let detail = format!(
                    "{} already carries a redirect installed by {}",
                    method.signature,
                    owners.join(", ")
                );
                for member in &redirects {
                    log.fail(
                        member.order,
                        &member.descriptor,
                        FailureReason::InstallConflict,
                        detail.clone(),
                    );
                }
            }
            None => {
                if let Some(ids) = apply_redirects(host, &method, redirects, &mut log) {
                    session.record_redirect(method.handle, ids);
                }
            }
        }
    }

    log.entries.sort_by_key(|(order, _)| *order);
    for id in log.applied {
        session.mark_installed(id);
    }
    let outcomes: Vec<PatchOutcome> = log.entries.into_iter().map(|(_, o)| o).collect();
    let summary = OutcomeSummary::tally(&outcomes);
    session.record(outcomes);
    info!(%summary, "installation pass finished");
    summary
}

/// Asks the host about every capability the pending descriptors require.
fn probe_capabilities<H: Host + ?Sized>(
    session: &mut ApplicationSession,
    host: &H,
    pending: &[PatchDescriptor],
) {
    let wanted: BTreeSet<&str> = pending
        .iter()
        .filter_map(|d| d.required_capability.as_deref())
        .collect();
    for cap in wanted {
        if !session.capabilities().contains(cap) && host.has_capability(cap) {
            session.add_capability(cap);
        }
    }
}

/// Composes all `Replace`/`Before`/`After` patches of one target into a
/// single redirect. `members` must already be in priority order. Returns the
/// ids carried by the installed redirect.
fn apply_redirects<H: Host + ?Sized>(
    host: &mut H,
    method: &MethodInfo,
    members: Vec<Resolved>,
    log: &mut PassLog,
) -> Option<Vec<PatchId>> {
    let (replaces, hooks): (Vec<Resolved>, Vec<Resolved>) = members
        .into_iter()
        .partition(|r| r.descriptor.kind() == PatchKind::Replace);

    let mut replaces = replaces.into_iter();
    let winner = replaces.next();

    if let Some(winner) = &winner {
        let winner_id = &winner.descriptor.id;
        let conflicted = !hooks.is_empty();
        for loser in replaces {
            let reason = if conflicted {
                SkipReason::Conflict {
                    with: winner_id.clone(),
                }
            } else {
                SkipReason::Superseded {
                    by: winner_id.clone(),
                }
            };
            log.skip(loser.order, &loser.descriptor, reason);
        }

        if conflicted {
            let names: Vec<String> = hooks.iter().map(|h| h.descriptor.id.to_string()).collect();
            log.fail(
                winner.order,
                &winner.descriptor,
                FailureReason::InstallConflict,
                format!(
                    "replace cannot be combined with before/after patches on the same target ({})",
                    names.join(", ")
                ),
            );
            for hook in &hooks {
                log.skip(
                    hook.order,
                    &hook.descriptor,
                    SkipReason::Conflict {
                        with: winner_id.clone(),
                    },
                );
            }
            return None;
        }
    }

    let mut redirect = Redirect::default();
    let mut installed: Vec<Resolved> = Vec::new();
    for member in winner.into_iter().chain(hooks) {
        let hook = |func: HookFn| Hook {
            patch: member.descriptor.id.clone(),
            func,
        };
        match &member.descriptor.action {
            PatchAction::Replace(f) => redirect.replacement = Some(hook(f.clone())),
            PatchAction::Before(f) => redirect.before.push(hook(f.clone())),
            PatchAction::After(f) => redirect.after.push(hook(f.clone())),
            // partitioned out by the caller
            PatchAction::StreamRewrite(_) => continue,
        }
        installed.push(member);
    }

    match host.install_redirect(method, redirect) {
        Ok(()) => {
            for member in &installed {
                log.push(member.order, &member.descriptor, PatchState::Applied);
            }
            Some(installed.into_iter().map(|m| m.descriptor.id).collect())
        }
        Err(err) => {
            for member in &installed {
                log.fail(
                    member.order,
                    &member.descriptor,
                    FailureReason::HostError,
                    err.to_string(),
                );
            }
            None
        }
    }
}

/// Runs every stream rewrite of one target in priority order, each on the
/// output of the previous successful one, then installs the result once.
fn apply_rewrites<H: Host + ?Sized>(
    host: &mut H,
    method: &MethodInfo,
    members: Vec<Resolved>,
    log: &mut PassLog,
) {
    let mut body = match load_body(&*host, method) {
        Ok(body) => body,
        Err(detail) => {
            for member in &members {
                log.fail(
                    member.order,
                    &member.descriptor,
                    FailureReason::HostError,
                    detail.clone(),
                );
            }
            return;
        }
    };

    let mut succeeded: Vec<Resolved> = Vec::new();
    for member in members {
        let rewrite = match &member.descriptor.action {
            PatchAction::StreamRewrite(f) => f.clone(),
            _ => continue,
        };

        let mut work = body.clone();
        let result = panic::catch_unwind(AssertUnwindSafe(|| rewrite(&mut work)));
        let failure = match result {
            Ok(Ok(())) => match work.verify() {
                Ok(_) => None,
                Err(err) => Some((
                    FailureReason::ImbalancedEdit,
                    format!("rewritten body fails verification: {}", err),
                )),
            },
            Ok(Err(err)) if err.is_pattern_miss() => {
                Some((FailureReason::PatternNotFound, err.to_string()))
            }
            Ok(Err(err)) => Some((FailureReason::ImbalancedEdit, err.to_string())),
            Err(_) => Some((
                FailureReason::ImbalancedEdit,
                "rewrite function panicked".to_string(),
            )),
        };

        match failure {
            None => {
                body = work;
                succeeded.push(member);
            }
            Some((reason, detail)) => log.fail(member.order, &member.descriptor, reason, detail),
        }
    }

    if succeeded.is_empty() {
        return;
    }

    let installed = body
        .to_raw()
        .map_err(|e| (FailureReason::ImbalancedEdit, e.to_string()))
        .and_then(|raw| {
            host.install_body(method, raw)
                .map_err(|e| (FailureReason::HostError, e.to_string()))
        });

    match installed {
        Ok(()) => {
            for member in &succeeded {
                log.push(member.order, &member.descriptor, PatchState::Applied);
            }
        }
        Err((reason, detail)) => {
            for member in &succeeded {
                log.fail(member.order, &member.descriptor, reason, detail.clone());
            }
        }
    }
}

fn load_body<H: Host + ?Sized>(host: &H, method: &MethodInfo) -> Result<MethodBody, String> {
    let raw = host.read_body(method).map_err(|e| e.to_string())?;
    let body = MethodBody::from_raw(method.signature.clone(), &raw)
        .map_err(|e| format!("host body of {} is unreadable: {}", method.signature, e))?;
    body.verify()
        .map_err(|e| format!("host body of {} does not verify: {}", method.signature, e))?;
    Ok(body)
}
