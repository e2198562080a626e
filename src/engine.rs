//! Pass orchestration.
//!
//! [`ProtectionEngine`] drives a run: it validates the configuration, walks
//! the pass catalog in order, executes every enabled pass under failure
//! isolation and finishes with a module-wide integrity and branch cleanup.
//! One failing pass never aborts the run; it is logged, counted and the next
//! pass proceeds against the module as the failed pass left it.
//!
//! Externally written passes are registered with [`ProtectionEngine::
//! register_pass`] and run after the built-in catalog when the `EXTENSIONS`
//! flag is set. A single pass can also be invoked by display name through
//! [`ProtectionEngine::apply_pass`].

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use strum::IntoEnumIterator;

use crate::{
    config::{EngineConfig, ProtectionFlags},
    events::{DerivedStats, EventKind, EventLog},
    flow, integrity,
    logger::Logger,
    model::{Body, Module},
    passes::{self, PassContext, PassKind, ProtectionPass, RunCaches},
    Error, Result,
};

/// Where the engine currently is in its run lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// No run started yet.
    Idle,
    /// Validating configuration and building run state.
    Initializing,
    /// Executing the named pass.
    Running(&'static str),
    /// Module-wide repair and branch cleanup.
    Finalizing,
    /// The last run completed.
    Done,
    /// The last run aborted during initialization.
    Failed,
}

/// How a single pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStatus {
    /// The pass ran and changed the module.
    Applied,
    /// The pass ran and found nothing to do.
    Clean,
    /// The pass returned an error; the run continued without it.
    Failed,
}

/// Outcome of one executed pass.
#[derive(Debug, Clone)]
pub struct PassOutcome {
    /// Display name of the pass.
    pub name: &'static str,
    /// How the pass ended.
    pub status: PassStatus,
    /// The error message, when the pass failed.
    pub error: Option<String>,
}

/// Everything a completed run reports.
#[derive(Debug, Clone)]
pub struct RunSummary {
    /// Per-pass outcomes in execution order.
    pub outcomes: Vec<PassOutcome>,
    /// Flag bits of the passes that changed the module.
    pub applied_flags: ProtectionFlags,
    /// Passes that changed the module.
    pub applied: usize,
    /// Passes that ran without finding anything.
    pub clean: usize,
    /// Passes that failed and were isolated.
    pub failed: usize,
    /// Catalog entries skipped because their flag was not set.
    pub skipped: usize,
    /// Statistics derived from the event log.
    pub stats: DerivedStats,
    /// The full event log of the run.
    pub events: EventLog,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

impl RunSummary {
    /// One-line human summary of the run.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "{} pass(es) applied, {} clean, {} failed, {} skipped: {}",
            self.applied,
            self.clean,
            self.failed,
            self.skipped,
            self.stats.summary()
        )
    }
}

/// The protection-removal orchestrator.
pub struct ProtectionEngine {
    config: EngineConfig,
    state: EngineState,
    registry: Vec<Arc<dyn ProtectionPass>>,
}

impl ProtectionEngine {
    /// Creates an engine for the given configuration.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        ProtectionEngine {
            config,
            state: EngineState::Idle,
            registry: Vec::new(),
        }
    }

    /// Returns the run configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Registers an extension pass.
    ///
    /// Extension passes run after the built-in catalog, in registration
    /// order, whenever the `EXTENSIONS` flag is enabled.
    pub fn register_pass(&mut self, pass: Arc<dyn ProtectionPass>) {
        self.registry.push(pass);
    }

    /// Runs every enabled pass against the module.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration fails validation;
    /// individual pass failures are isolated and reported in the summary
    /// instead of propagating.
    pub fn process(&mut self, module: &mut Module, logger: &dyn Logger) -> Result<RunSummary> {
        let start = Instant::now();
        self.state = EngineState::Initializing;
        if let Err(error) = self.config.validate() {
            self.state = EngineState::Failed;
            return Err(error);
        }

        let events = EventLog::new();
        let caches = RunCaches::new();
        let mut outcomes = Vec::new();
        let mut applied_flags = ProtectionFlags::empty();
        let mut skipped = 0;

        for kind in PassKind::iter() {
            if !self.config.passes.contains(kind.flag()) {
                skipped += 1;
                continue;
            }
            if kind == PassKind::Extensions {
                let registered: Vec<Arc<dyn ProtectionPass>> = self.registry.clone();
                for pass in &registered {
                    let outcome =
                        self.run_isolated(pass.as_ref(), module, &events, &caches, logger);
                    if outcome.status == PassStatus::Applied {
                        applied_flags |= kind.flag();
                    }
                    outcomes.push(outcome);
                }
                continue;
            }
            let Some(pass) = passes::instantiate(kind) else {
                continue;
            };
            let outcome = self.run_isolated(pass.as_ref(), module, &events, &caches, logger);
            if outcome.status == PassStatus::Applied {
                applied_flags |= kind.flag();
            }
            outcomes.push(outcome);
        }

        self.state = EngineState::Finalizing;
        integrity::repair_module(module);
        module.par_for_each_method_mut(|method| {
            if let Some(body) = method.body.as_mut() {
                optimize_branches(body);
            }
        });

        self.state = EngineState::Done;
        let applied = count(&outcomes, PassStatus::Applied);
        let clean = count(&outcomes, PassStatus::Clean);
        let failed = count(&outcomes, PassStatus::Failed);
        let elapsed = start.elapsed();
        let stats = DerivedStats::from_log(&events).with_time(elapsed);
        let summary = RunSummary {
            outcomes,
            applied_flags,
            applied,
            clean,
            failed,
            skipped,
            stats,
            events,
            elapsed,
        };
        logger.success(&summary.summary());
        Ok(summary)
    }

    /// Runs one pass by display name.
    ///
    /// Built-in passes resolve through the catalog (case-insensitive);
    /// anything else is matched against the registered extension passes.
    /// Returns whether the pass changed the module.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownPass`] when no pass carries the name, or
    /// [`Error::Pass`] when the pass itself fails.
    pub fn apply_pass(
        &mut self,
        module: &mut Module,
        name: &str,
        logger: &dyn Logger,
    ) -> Result<bool> {
        let builtin: Option<Box<dyn ProtectionPass>> = PassKind::from_str(name)
            .ok()
            .and_then(passes::instantiate);
        let extension: Option<Arc<dyn ProtectionPass>> = if builtin.is_none() {
            self.registry
                .iter()
                .find(|pass| pass.name().eq_ignore_ascii_case(name))
                .cloned()
        } else {
            None
        };
        let pass: &dyn ProtectionPass = match (&builtin, &extension) {
            (Some(pass), _) => pass.as_ref(),
            (None, Some(pass)) => pass.as_ref(),
            (None, None) => return Err(Error::UnknownPass(name.to_string())),
        };

        let events = EventLog::new();
        let caches = RunCaches::new();
        let outcome = self.run_isolated(pass, module, &events, &caches, logger);
        integrity::repair_module(module);
        self.state = EngineState::Done;
        match outcome.status {
            PassStatus::Applied => Ok(true),
            PassStatus::Clean => Ok(false),
            PassStatus::Failed => Err(Error::Pass(
                outcome.error.unwrap_or_else(|| name.to_string()),
            )),
        }
    }

    fn run_isolated(
        &mut self,
        pass: &dyn ProtectionPass,
        module: &mut Module,
        events: &EventLog,
        caches: &RunCaches,
        logger: &dyn Logger,
    ) -> PassOutcome {
        let name = pass.name();
        self.state = EngineState::Running(name);
        events.record(EventKind::PassStarted).pass(name);

        let ctx = PassContext {
            config: &self.config,
            events,
            logger,
            caches,
        };
        match pass.run(module, &ctx) {
            Ok(changed) => {
                events
                    .record(EventKind::PassCompleted)
                    .pass(name)
                    .message(if changed { "changes applied" } else { "nothing to do" });
                PassOutcome {
                    name,
                    status: if changed { PassStatus::Applied } else { PassStatus::Clean },
                    error: None,
                }
            }
            Err(error) => {
                logger.error(&format!("Pass '{name}' failed: {error}"));
                events
                    .record(EventKind::PassFailed)
                    .pass(name)
                    .message(error.to_string());
                PassOutcome {
                    name,
                    status: PassStatus::Failed,
                    error: Some(error.to_string()),
                }
            }
        }
    }
}

fn count(outcomes: &[PassOutcome], status: PassStatus) -> usize {
    outcomes
        .iter()
        .filter(|outcome| outcome.status == status)
        .count()
}

/// The finalization cleanup applied to every body.
fn optimize_branches(body: &mut Body) {
    flow::simplify_branches(body);
    flow::remove_branches_to_next(body);
    flow::remove_nops(body);
    integrity::repair_body(body);
}
