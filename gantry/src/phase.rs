//! Interpretation of observed pod status into task phases.
//!
//! Kubernetes reports pod status for long-running services that are expected
//! to recover from failures; task pods either run to completion or fail. The
//! interpreters here turn the ambiguous status surface into a deterministic
//! retry or abort decision: which failures count against the user's retry
//! budget, which are the platform's fault, and which are hopeless.

use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use gantry_core::PhaseInfo;
use gantry_core::phase::TaskInfo;
use k8s_openapi::api::core::v1::ContainerState;
use k8s_openapi::api::core::v1::ContainerStatus;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::core::v1::PodStatus;
use tracing::warn;

use crate::config::PluginConfig;

/// The termination reason recorded for containers killed by the OOM killer.
pub const OOM_KILLED: &str = "OOMKilled";

/// The reason reported for failures attributed to the platform.
pub const INTERRUPTED: &str = "Interrupted";

/// The reason reported when the primary container is missing from the pod's
/// container statuses.
pub const PRIMARY_CONTAINER_NOT_FOUND: &str = "PrimaryContainerNotFound";

/// The reason reported when a pod exceeded the pending timeout.
pub const POD_PENDING_TIMEOUT: &str = "PodPendingTimeout";

/// The exit code of containers terminated by SIGKILL.
const SIGKILL: i32 = 137;

/// The unsigned representation of the SIGKILL exit code (256 - 9).
const UNSIGNED_SIGKILL: i32 = 247;

/// Pod status reasons that indicate the node was lost rather than the task
/// having failed.
///
/// Kubelet can miss deleting a pod prior to its node being shut down, and
/// kubelet admission can reject a pod before the node carries its final
/// labels. These differ across providers and Kubernetes versions.
const RETRYABLE_STATUS_REASONS: &[&str] = &["Shutdown", "Terminated", "NodeShutdown", "NodeAffinity"];

/// Determines whether a container state is a termination by SIGKILL.
fn is_terminated_with_sigkill(state: &ContainerState) -> bool {
    state
        .terminated
        .as_ref()
        .is_some_and(|t| t.exit_code == SIGKILL || t.exit_code == UNSIGNED_SIGKILL)
}

/// Gets the wall-clock time elapsed since the given instant.
///
/// The instant is stamped by the kubelet while `now` comes from this
/// process's clock; the two are not synchronized, so the result is an
/// approximation.
fn elapsed_since(instant: DateTime<Utc>) -> Duration {
    (Utc::now() - instant).to_std().unwrap_or_default()
}

/// Formats a duration as hours, minutes, and seconds with all units below
/// the leading one spelled out (e.g. `3m0s`, `1h2m3s`, `45s`).
fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    let mut formatted = String::new();
    if hours > 0 {
        formatted.push_str(&format!("{hours}h"));
    }
    if hours > 0 || minutes > 0 {
        formatted.push_str(&format!("{minutes}m"));
    }
    formatted.push_str(&format!("{seconds}s"));
    formatted
}

/// Prefixes a message with the grace period that elapsed before it was
/// emitted.
fn message_after_grace_period(message: &str, grace_period: Duration) -> String {
    format!(
        "Grace period [{grace}] exceeded|{message}",
        grace = format_duration(grace_period)
    )
}

/// Iterates every container status of the pod: init, regular, and ephemeral.
fn all_container_statuses(status: &PodStatus) -> impl Iterator<Item = &ContainerStatus> {
    status
        .init_container_statuses
        .iter()
        .flatten()
        .chain(status.container_statuses.iter().flatten())
        .chain(status.ephemeral_container_statuses.iter().flatten())
}

/// Classifies an observed pod status into a task phase.
///
/// Dispatches on the pod's top-level phase; observations that carry no phase
/// (or an unknown one) are undefined and left for the caller to retry.
pub fn determine_task_phase(
    status: &PodStatus,
    info: &TaskInfo,
    primary_container_name: &str,
    config: &PluginConfig,
) -> PhaseInfo {
    match status.phase.as_deref() {
        Some("Pending") => interpret_pending(status, info, config),
        Some("Succeeded") => interpret_success(status, info),
        Some("Failed") => interpret_failure(status, info, primary_container_name),
        Some("Running") => primary_container_phase(
            primary_container_name,
            status.container_statuses.as_deref().unwrap_or_default(),
            info,
        ),
        _ => PhaseInfo::undefined(),
    }
}

/// Classifies a pod whose top-level phase is `Pending`.
///
/// A pending pod may be healthily working towards running, or it may be stuck
/// in a state it will never leave. The conditions and container statuses are
/// examined to tell the two apart; transient container runtime errors are
/// tolerated for a configured grace period before the task is failed.
pub fn interpret_pending(status: &PodStatus, info: &TaskInfo, config: &PluginConfig) -> PhaseInfo {
    let (phase_info, transitioned_at) = interpret_pending_conditions(status, info, config);

    if phase_info.phase().is_terminal() {
        return phase_info;
    }

    // A pod that has been pending for longer than the configured timeout is
    // failed so that it may be retried elsewhere.
    let timeout = config.pod_pending_timeout;
    if !timeout.is_zero() && elapsed_since(transitioned_at) >= timeout {
        return PhaseInfo::retryable_failure(
            POD_PENDING_TIMEOUT,
            phase_info.reason().unwrap_or_default(),
            &TaskInfo::occurred_at(transitioned_at),
        )
        .with_cleanup();
    }

    phase_info
}

/// Walks the conditions of a pending pod.
///
/// Returns the classified phase and the transition time of the last condition
/// examined.
fn interpret_pending_conditions(
    status: &PodStatus,
    info: &TaskInfo,
    config: &PluginConfig,
) -> (PhaseInfo, DateTime<Utc>) {
    let now = Utc::now();
    let mut transitioned_at = now;

    for condition in status.conditions.iter().flatten() {
        transitioned_at = condition
            .last_transition_time
            .as_ref()
            .map(|t| t.0)
            .unwrap_or(now);
        let t = transitioned_at;

        let condition_reason = condition.reason.as_deref().unwrap_or_default();
        let condition_message = condition.message.as_deref().unwrap_or_default();

        match condition.type_.as_str() {
            // Waiting to be scheduled; this usually reflects an inability to
            // acquire resources, which the scheduler keeps retrying, so the
            // task stays queued.
            "PodScheduled" if condition.status == "False" => {
                return (
                    PhaseInfo::queued(t, format!("{condition_reason}:{condition_message}")),
                    t,
                );
            }
            "Unschedulable" => {
                return (
                    PhaseInfo::queued(t, format!("{condition_reason}:{condition_message}")),
                    t,
                );
            }
            "Ready" if condition.status == "False" => {
                // A not-ready pod points at its containers; a container stuck
                // waiting tells us why the pod cannot start.
                for container_status in status.container_statuses.iter().flatten() {
                    if container_status.ready {
                        continue;
                    }

                    let Some(waiting) =
                        container_status.state.as_ref().and_then(|s| s.waiting.as_ref())
                    else {
                        continue;
                    };

                    let reason = waiting.reason.as_deref().unwrap_or_default();
                    let final_reason = format!("{condition_reason}|{reason}");
                    let final_message = format!(
                        "{condition_message}|{message}",
                        message = waiting.message.as_deref().unwrap_or_default()
                    );

                    match reason {
                        // The only reasons a healthily-starting pod shows:
                        // ErrImagePull transitions into ImagePullBackOff,
                        // ContainerCreating means the image is downloading,
                        // and PodInitializing means init containers are
                        // running.
                        "ErrImagePull" | "ContainerCreating" | "PodInitializing" => {
                            return (
                                PhaseInfo::initializing(t, final_reason, final_message),
                                t,
                            );
                        }
                        // Container runtime errors may be transient (a
                        // container name briefly still in use) or permanent
                        // (no command specified). Rather than pattern-match
                        // messages, allow a grace period for the kubelet to
                        // resolve transient cases and fail the task once it
                        // elapses.
                        "CreateContainerError" => {
                            let grace_period = config.create_container_error_grace_period;
                            if elapsed_since(t) >= grace_period {
                                return (
                                    PhaseInfo::failure(
                                        final_reason,
                                        message_after_grace_period(&final_message, grace_period),
                                        &TaskInfo::occurred_at(t),
                                    )
                                    .with_cleanup(),
                                    t,
                                );
                            }

                            return (
                                PhaseInfo::initializing(t, final_reason, final_message),
                                t,
                            );
                        }
                        "CreateContainerConfigError" => {
                            let grace_period = config.create_container_config_error_grace_period;
                            if elapsed_since(t) >= grace_period {
                                return (
                                    PhaseInfo::failure(
                                        final_reason,
                                        message_after_grace_period(&final_message, grace_period),
                                        &TaskInfo::occurred_at(t),
                                    )
                                    .with_cleanup(),
                                    t,
                                );
                            }

                            return (
                                PhaseInfo::initializing(t, final_reason, final_message),
                                t,
                            );
                        }
                        "InvalidImageName" => {
                            return (
                                PhaseInfo::failure(
                                    final_reason,
                                    final_message,
                                    &TaskInfo::occurred_at(t),
                                )
                                .with_cleanup(),
                                t,
                            );
                        }
                        "ImagePullBackOff" => {
                            let grace_period = config.image_pull_backoff_grace_period;
                            if elapsed_since(t) >= grace_period {
                                return (
                                    PhaseInfo::retryable_failure(
                                        final_reason,
                                        message_after_grace_period(&final_message, grace_period),
                                        &TaskInfo::occurred_at(t),
                                    )
                                    .with_cleanup(),
                                    t,
                                );
                            }

                            return (
                                PhaseInfo::initializing(t, final_reason, final_message),
                                t,
                            );
                        }
                        // An unexpected waiting reason would otherwise leave
                        // the task queued until the pod is reaped and lookups
                        // start failing, so fail it immediately as the
                        // platform's fault.
                        _ => {
                            return (
                                PhaseInfo::system_retryable_failure(
                                    final_reason,
                                    final_message,
                                    &TaskInfo::occurred_at(t),
                                )
                                .with_cleanup(),
                                t,
                            );
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let mut seed = PhaseInfo::queued(now, "Scheduling");
    if let Some(occurred_at) = info.occurred_at {
        seed = seed.with_occurred_at(occurred_at);
    }

    (seed, transitioned_at)
}

/// Classifies a pod whose top-level phase is `Succeeded`.
///
/// A pod can report success even though one of its containers was OOM killed;
/// such a pod is treated as a failure attributable to the user.
pub fn interpret_success(status: &PodStatus, info: &TaskInfo) -> PhaseInfo {
    for container_status in all_container_statuses(status) {
        let terminated = container_status
            .state
            .as_ref()
            .and_then(|s| s.terminated.as_ref());

        if let Some(terminated) = terminated {
            if terminated
                .reason
                .as_deref()
                .unwrap_or_default()
                .contains(OOM_KILLED)
            {
                return PhaseInfo::retryable_failure(
                    OOM_KILLED,
                    "Pod reported success despite being OOMKilled",
                    info,
                );
            }
        }
    }

    PhaseInfo::success(info)
}

/// Classifies a pod whose top-level phase is `Failed`.
///
/// The pod's status reason and every terminated container feed the decision
/// of whether the failure counts against the user's retry budget. Failures
/// attributable to the node (shutdowns, SIGKILL on the primary container, or
/// a kubelet that never recorded a cause) are classified as system errors.
pub fn interpret_failure(
    status: &PodStatus,
    info: &TaskInfo,
    primary_container_name: &str,
) -> PhaseInfo {
    let mut code = status
        .reason
        .as_deref()
        .filter(|r| !r.is_empty())
        .unwrap_or("UnknownError")
        .to_string();
    let mut message = status
        .message
        .as_deref()
        .filter(|m| !m.is_empty())
        .unwrap_or("Pod failed. No message received from kubernetes.")
        .to_string();

    let mut is_system_error = RETRYABLE_STATUS_REASONS.contains(&code.as_str());

    for container_status in all_container_statuses(status) {
        // Prefer the last termination state when the container was restarted
        // after its recorded termination.
        let terminated = container_status
            .last_state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
            .or_else(|| {
                container_status
                    .state
                    .as_ref()
                    .and_then(|s| s.terminated.as_ref())
            });

        let Some(terminated) = terminated else {
            continue;
        };

        let reason = terminated.reason.as_deref().unwrap_or_default();
        if reason.contains(OOM_KILLED) {
            code = OOM_KILLED.to_string();
        } else if terminated.exit_code == SIGKILL || terminated.exit_code == UNSIGNED_SIGKILL {
            // Some node terminations send SIGKILL to every container running
            // on the node; tag these as interruptions. When the primary
            // container is the one killed, the failure is the platform's
            // fault. This best-effort approach accepts some false positives:
            // if preemption terminates the kubelet before the pod's state is
            // persisted, the pod eventually disappears from the API server
            // and is counted as a system error by the caller.
            code = INTERRUPTED.to_string();
            if container_status.name == primary_container_name {
                is_system_error = true;
            }
        }

        if terminated.exit_code == 0 {
            message.push_str(&format!(
                "\r\n[{name}] terminated with ExitCode 0.",
                name = container_status.name
            ));
        } else {
            message.push_str(&format!(
                "\r\n[{name}] terminated with exit code ({exit_code}). Reason [{reason}]. Message: \n{msg}.",
                name = container_status.name,
                exit_code = terminated.exit_code,
                msg = terminated.message.as_deref().unwrap_or_default()
            ));
        }
    }

    // A reason that is still unknown means the kubelet never had the chance
    // to record a cause before the node was lost.
    if code == "UnknownError" {
        is_system_error = true;
    }

    if is_system_error {
        warn!("pod failed with a system error; code: {code}, message: {message}");
        return PhaseInfo::system_retryable_failure(INTERRUPTED, message, info);
    }

    warn!("pod failed with a user error; code: {code}, message: {message}");
    PhaseInfo::retryable_failure(code, message, info)
}

/// Classifies a pod by the state of its primary container.
///
/// Useful for multi-container pods where a sidecar may outlive the container
/// whose exit defines the task outcome.
pub fn primary_container_phase(
    primary_container_name: &str,
    statuses: &[ContainerStatus],
    info: &TaskInfo,
) -> PhaseInfo {
    for status in statuses {
        if status.name != primary_container_name {
            continue;
        }

        let Some(state) = status.state.as_ref() else {
            continue;
        };

        if state.waiting.is_some() || state.running.is_some() {
            return PhaseInfo::running(info);
        }

        if let Some(terminated) = state.terminated.as_ref() {
            let reason = terminated.reason.as_deref().unwrap_or_default();
            let message = format!(
                "\r\n[{name}] terminated with exit code ({exit_code}). Reason [{reason}]. Message: \n{msg}.",
                name = status.name,
                exit_code = terminated.exit_code,
                msg = terminated.message.as_deref().unwrap_or_default()
            );

            let phase_info = if reason.contains(OOM_KILLED) {
                // OOM kills arrive as SIGKILL too, but they are the user's
                // fault and count against the retry budget.
                PhaseInfo::retryable_failure(reason, message, info)
            } else if is_terminated_with_sigkill(state) {
                PhaseInfo::system_retryable_failure(reason, message, info)
            } else if terminated.exit_code != 0 {
                PhaseInfo::retryable_failure(reason, message, info)
            } else {
                return PhaseInfo::success(info);
            };

            warn!(
                "primary container terminated with an issue: {message}",
                message = phase_info.message().unwrap_or_default()
            );
            return phase_info;
        }
    }

    PhaseInfo::failure(
        PRIMARY_CONTAINER_NOT_FOUND,
        format!(
            "Primary container [{primary_container_name}] not found in pod's container statuses"
        ),
        info,
    )
}

/// Gets the time of the pod's most recent container state transition.
///
/// This is the maximum over container start and finish timestamps; `now` when
/// no container has transitioned.
pub fn last_transition_occurred_at(pod: &Pod) -> DateTime<Utc> {
    let mut last: Option<DateTime<Utc>> = None;

    let statuses = pod
        .status
        .iter()
        .flat_map(|s| {
            s.container_statuses
                .iter()
                .flatten()
                .chain(s.init_container_statuses.iter().flatten())
        });

    for status in statuses {
        let transitioned_at = match status.state.as_ref() {
            Some(ContainerState {
                running: Some(running),
                ..
            }) => running.started_at.as_ref().map(|t| t.0),
            Some(ContainerState {
                terminated: Some(terminated),
                ..
            }) => terminated.finished_at.as_ref().map(|t| t.0),
            _ => None,
        };

        if let Some(transitioned_at) = transitioned_at {
            if last.is_none_or(|last| transitioned_at > last) {
                last = Some(transitioned_at);
            }
        }
    }

    last.unwrap_or_else(Utc::now)
}

/// Gets the time the pod reported completion.
///
/// This is the latest `Ready=False` condition transition whose reason is
/// `PodCompleted`; `None` when the pod has not reported completion.
pub fn reported_at(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.status
        .iter()
        .flat_map(|s| s.conditions.iter().flatten())
        .filter(|c| {
            c.reason.as_deref() == Some("PodCompleted")
                && c.type_ == "Ready"
                && c.status == "False"
        })
        .filter_map(|c| c.last_transition_time.as_ref().map(|t| t.0))
        .max()
}
