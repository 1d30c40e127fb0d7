//! The pipeline controller: single-flight runs with a cost checkpoint.
//!
//! A run walks `fetch → scrape → confirm → summarize|skipped → embed → done`.
//! Stage calls are sequential; the only suspension the controller itself
//! introduces is the bounded wait in `confirm`. Run state is published on a
//! `watch` channel so [`PipelineController::status`] never waits on the run.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use feedwatch_shared::{
    ActualCost, CostDecision, CostEstimate, DecisionOutcome, FeedwatchError, PipelineConfig,
    RefreshRequest, RefreshStatus, Result, RunId, Stage, TriggerOutcome,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::approval::ApprovalRendezvous;
use crate::cost::{SessionCostAccountant, estimate_summarization_cost};
use crate::gate::{ConcurrencyGate, GateGuard};
use crate::stages::PipelineStages;

/// Everything observable about the current (or last) run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSnapshot {
    /// A run owns this snapshot and has not finished.
    pub active: bool,
    pub run_id: Option<RunId>,
    /// `None` before the first run.
    pub stage: Option<Stage>,
    pub cost_estimate: Option<CostEstimate>,
    pub actual_cost: Option<ActualCost>,
    /// Stages entered by the run, in order.
    pub history: Vec<Stage>,
    /// Message of the failure that ended the run, if any.
    pub last_error: Option<String>,
}

impl RunSnapshot {
    fn enter(&mut self, stage: Stage) {
        debug_assert!(
            self.stage
                .is_none_or(|last| !last.is_terminal() && last.ordinal() < stage.ordinal()),
            "stage {stage} entered after {:?}",
            self.stage
        );
        self.stage = Some(stage);
        self.history.push(stage);
    }
}

/// Owns all run state. Construct once and share as `Arc`.
pub struct PipelineController {
    stages: PipelineStages,
    config: PipelineConfig,
    accountant: Arc<SessionCostAccountant>,
    gate: ConcurrencyGate,
    approvals: ApprovalRendezvous,
    snapshot: watch::Sender<RunSnapshot>,
    last_run_id: AtomicU64,
}

impl PipelineController {
    pub fn new(
        stages: PipelineStages,
        config: PipelineConfig,
        accountant: Arc<SessionCostAccountant>,
    ) -> Arc<Self> {
        let (snapshot, _) = watch::channel(RunSnapshot::default());
        Arc::new(Self {
            stages,
            config,
            accountant,
            gate: ConcurrencyGate::new(),
            approvals: ApprovalRendezvous::new(),
            snapshot,
            last_run_id: AtomicU64::new(0),
        })
    }

    /// Start a run in the background unless one is already in flight.
    ///
    /// Never waits: a held gate yields `started == false` at once.
    /// Must be called from within a tokio runtime.
    pub fn trigger(self: &Arc<Self>, request: RefreshRequest) -> TriggerOutcome {
        let Some(guard) = self.gate.try_acquire() else {
            info!("refresh already in progress, trigger ignored");
            return TriggerOutcome::already_running();
        };

        let run_id = RunId(self.last_run_id.fetch_add(1, Ordering::AcqRel) + 1);
        self.snapshot.send_modify(|s| {
            *s = RunSnapshot {
                active: true,
                run_id: Some(run_id),
                ..RunSnapshot::default()
            };
            s.enter(Stage::Fetch);
        });
        info!(
            %run_id,
            lookback_days = request.lookback_days,
            since_last_fetch = request.since_last_fetch,
            "refresh started"
        );

        let controller = Arc::clone(self);
        tokio::spawn(async move { controller.supervise(run_id, request, guard).await });

        TriggerOutcome::started(run_id)
    }

    /// Lock-free view of the current run.
    pub fn status(&self) -> RefreshStatus {
        let snapshot = self.snapshot.borrow();
        RefreshStatus {
            is_refreshing: self.gate.is_held(),
            stage: snapshot.stage,
            run_id: snapshot.run_id,
            cost_estimate: snapshot.cost_estimate.clone(),
            actual_cost: snapshot.actual_cost.clone(),
        }
    }

    /// Full snapshot, including the stage history and last error.
    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot.subscribe()
    }

    /// Approve the estimate the current run is waiting on.
    pub fn approve(&self) -> DecisionOutcome {
        self.decide(CostDecision::Approved)
    }

    /// Decline the estimate the current run is waiting on.
    pub fn decline(&self) -> DecisionOutcome {
        self.decide(CostDecision::Declined)
    }

    fn decide(&self, decision: CostDecision) -> DecisionOutcome {
        if self.snapshot.borrow().stage != Some(Stage::Confirm) {
            return DecisionOutcome::NoPendingDecision;
        }
        self.approvals.decide(decision)
    }

    /// Decide for a specific run; a mismatched id is rejected as stale.
    pub fn decide_for(&self, run_id: RunId, decision: CostDecision) -> DecisionOutcome {
        let snapshot = self.snapshot.borrow().clone();
        if snapshot.stage != Some(Stage::Confirm) {
            return DecisionOutcome::NoPendingDecision;
        }
        if snapshot.run_id != Some(run_id) {
            debug!(requested = %run_id, "decision for a run that is not waiting");
            return DecisionOutcome::StaleRun;
        }
        self.approvals.decide_for(run_id, decision)
    }

    /// Clear the published actual-cost report. Returns whether one existed.
    pub fn dismiss_actual_cost(&self) -> bool {
        self.snapshot.send_if_modified(|s| s.actual_cost.take().is_some())
    }

    /// Resolve once no run is active, returning the final snapshot.
    pub async fn wait_until_idle(&self) -> RunSnapshot {
        let mut rx = self.snapshot.subscribe();
        match rx.wait_for(|s| !s.active).await {
            Ok(snapshot) => snapshot.clone(),
            Err(_) => self.snapshot(),
        }
    }

    /// Runs the stages on their own task so a panic still lands here.
    async fn supervise(self: Arc<Self>, run_id: RunId, request: RefreshRequest, guard: GateGuard) {
        let worker = Arc::clone(&self);
        let result = match tokio::spawn(async move { worker.execute(run_id, request).await }).await
        {
            Ok(result) => result,
            Err(join_err) => Err(FeedwatchError::pipeline(
                self.current_stage(),
                format!("stage task aborted: {join_err}"),
            )),
        };

        match result {
            Ok(()) => info!(%run_id, "refresh finished"),
            Err(err) => {
                let stage = self.current_stage();
                error!(%run_id, %stage, error = %err, "refresh failed");
                self.approvals.close(run_id);
                self.publish(run_id, |s| {
                    s.cost_estimate = None;
                    s.last_error = Some(err.to_string());
                    s.enter(Stage::Error);
                });
            }
        }

        guard.release();
        self.snapshot.send_if_modified(|s| {
            if s.run_id == Some(run_id) && s.active {
                s.active = false;
                true
            } else {
                false
            }
        });
    }

    #[instrument(skip_all, fields(%run_id))]
    async fn execute(&self, run_id: RunId, request: RefreshRequest) -> Result<()> {
        let stages = &self.stages;
        self.accountant.reset();

        // fetch
        let removed = stages.cleanup.remove_unprocessable().await?;
        let mut fetched = 0;
        for source in &stages.sources {
            let new_items = source
                .fetch(request.lookback_days, request.since_last_fetch)
                .await?;
            debug!(source = source.name(), new_items, "source fetched");
            fetched += new_items;
        }
        info!(removed, fetched, "fetch complete");

        // scrape
        self.enter(run_id, Stage::Scrape);
        let scraped = drain(self.config.scrape_batch_size, |limit| {
            stages.extractor.process_batch(limit)
        })
        .await?;
        info!(scraped, "scrape complete");

        // confirm
        let pending = stages.enricher.count_pending().await?;
        if pending == 0 {
            debug!("nothing waiting for summarization");
        } else if !stages.provider.has_api_key() {
            warn!(pending, "no LLM API key configured, skipping summarization");
            self.enter(run_id, Stage::Skipped);
        } else {
            self.confirm_and_summarize(run_id, pending).await?;
        }

        // embed
        self.enter(run_id, Stage::Embed);
        let embedded = drain(self.config.embed_batch_size, |limit| {
            stages.embedder.process_batch(limit)
        })
        .await?;
        info!(embedded, "embed complete");

        self.enter(run_id, Stage::Done);
        Ok(())
    }

    async fn confirm_and_summarize(&self, run_id: RunId, pending: usize) -> Result<()> {
        let model = self.stages.provider.model_name();
        let estimate = CostEstimate {
            run_id,
            pending_item_count: pending,
            estimated_cost: estimate_summarization_cost(pending, &model),
            model,
        };
        info!(
            pending,
            estimated_cost = estimate.estimated_cost,
            model = %estimate.model,
            "awaiting cost approval"
        );

        // Open before publishing so a decision made on sight of `confirm`
        // always finds the slot.
        let waiter = self.approvals.open(run_id);
        self.publish(run_id, |s| {
            s.cost_estimate = Some(estimate);
            s.enter(Stage::Confirm);
        });

        let outcome = self
            .approvals
            .wait(waiter, self.config.approval_timeout)
            .await;
        if !outcome.proceeds() {
            info!("summarization declined");
            self.publish(run_id, |s| {
                s.cost_estimate = None;
                s.enter(Stage::Skipped);
            });
            return Ok(());
        }

        self.publish(run_id, |s| {
            s.cost_estimate = None;
            s.enter(Stage::Summarize);
        });

        let before = self.accountant.get_tokens();
        let summarized = drain(self.config.summarize_batch_size, |limit| {
            self.stages.enricher.process_batch(limit)
        })
        .await?;
        let usage = self.accountant.get_tokens().since(before);

        let model = self.stages.provider.model_name();
        let actual = ActualCost {
            run_id,
            item_count: summarized,
            actual_cost: usage.cost(&model),
            model,
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
        };
        info!(
            summarized,
            actual_cost = actual.actual_cost,
            input_tokens = usage.input_tokens,
            output_tokens = usage.output_tokens,
            "summarize complete"
        );
        self.publish(run_id, |s| s.actual_cost = Some(actual));
        Ok(())
    }

    fn current_stage(&self) -> Stage {
        self.snapshot.borrow().stage.unwrap_or(Stage::Fetch)
    }

    fn enter(&self, run_id: RunId, stage: Stage) {
        debug!(%stage, "entering stage");
        self.publish(run_id, |s| s.enter(stage));
    }

    /// Apply `update` only while `run_id` still owns the snapshot.
    fn publish(&self, run_id: RunId, update: impl FnOnce(&mut RunSnapshot)) {
        self.snapshot.send_if_modified(|s| {
            if s.run_id != Some(run_id) {
                return false;
            }
            update(s);
            true
        });
    }
}

/// Call `batch` until it reports nothing processed; returns the total.
async fn drain<F, Fut>(limit: usize, mut batch: F) -> Result<usize>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<usize>>,
{
    let mut total = 0;
    loop {
        let processed = batch(limit).await?;
        if processed == 0 {
            return Ok(total);
        }
        total += processed;
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::stages::{Cleanup, ContentExtractor, Embedder, Enricher, FeedSource, ProviderInfo};

    struct NoopCleanup;

    #[async_trait]
    impl Cleanup for NoopCleanup {
        async fn remove_unprocessable(&self) -> Result<usize> {
            Ok(0)
        }
    }

    struct StaticSource {
        new_items: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl FeedSource for StaticSource {
        fn name(&self) -> &str {
            "static"
        }

        async fn fetch(&self, _lookback_days: u32, _since_last_fetch: bool) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.new_items)
        }
    }

    /// Returns scripted batch sizes, then 0. Optionally parks on the first call.
    #[derive(Default)]
    struct ScriptedExtractor {
        batches: Mutex<VecDeque<usize>>,
        limits: Mutex<Vec<usize>>,
        hold: Option<Arc<Notify>>,
        fail: bool,
    }

    #[async_trait]
    impl ContentExtractor for ScriptedExtractor {
        async fn process_batch(&self, limit: usize) -> Result<usize> {
            let first = {
                let mut limits = self.limits.lock().unwrap();
                limits.push(limit);
                limits.len() == 1
            };
            if first {
                if let Some(hold) = &self.hold {
                    hold.notified().await;
                }
            }
            if self.fail {
                return Err(FeedwatchError::Network("connection reset".into()));
            }
            Ok(self.batches.lock().unwrap().pop_front().unwrap_or(0))
        }
    }

    /// Summarizes from a pending pool, charging fixed tokens per item.
    struct PoolEnricher {
        pending: AtomicUsize,
        processed: AtomicUsize,
        accountant: Arc<SessionCostAccountant>,
    }

    #[async_trait]
    impl Enricher for PoolEnricher {
        async fn count_pending(&self) -> Result<usize> {
            Ok(self.pending.load(Ordering::SeqCst))
        }

        async fn process_batch(&self, limit: usize) -> Result<usize> {
            let take = self.pending.load(Ordering::SeqCst).min(limit);
            self.pending.fetch_sub(take, Ordering::SeqCst);
            self.processed.fetch_add(take, Ordering::SeqCst);
            for _ in 0..take {
                self.accountant.add_tokens(4000, 500);
            }
            Ok(take)
        }
    }

    #[derive(Default)]
    struct CountingEmbedder {
        calls: AtomicUsize,
        panic: bool,
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn process_batch(&self, _limit: usize) -> Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("embedding backend exploded");
            }
            Ok(0)
        }
    }

    struct FixedProvider {
        has_key: bool,
    }

    impl ProviderInfo for FixedProvider {
        fn has_api_key(&self) -> bool {
            self.has_key
        }

        fn model_name(&self) -> String {
            "gpt-4o-mini".into()
        }
    }

    struct Harness {
        controller: Arc<PipelineController>,
        accountant: Arc<SessionCostAccountant>,
        source: Arc<StaticSource>,
        extractor: Arc<ScriptedExtractor>,
        enricher: Arc<PoolEnricher>,
        embedder: Arc<CountingEmbedder>,
    }

    fn harness(pending: usize, has_key: bool, extractor: ScriptedExtractor) -> Harness {
        harness_with(pending, has_key, extractor, CountingEmbedder::default())
    }

    fn harness_with(
        pending: usize,
        has_key: bool,
        extractor: ScriptedExtractor,
        embedder: CountingEmbedder,
    ) -> Harness {
        let accountant = Arc::new(SessionCostAccountant::new());
        let source = Arc::new(StaticSource {
            new_items: 0,
            calls: AtomicUsize::new(0),
        });
        let extractor = Arc::new(extractor);
        let enricher = Arc::new(PoolEnricher {
            pending: AtomicUsize::new(pending),
            processed: AtomicUsize::new(0),
            accountant: Arc::clone(&accountant),
        });
        let embedder = Arc::new(embedder);
        let stages = PipelineStages {
            cleanup: Arc::new(NoopCleanup),
            sources: vec![source.clone() as Arc<dyn FeedSource>, source.clone()],
            extractor: extractor.clone(),
            enricher: enricher.clone(),
            embedder: embedder.clone(),
            provider: Arc::new(FixedProvider { has_key }),
        };
        let config = PipelineConfig {
            approval_timeout: Duration::from_secs(300),
            scrape_batch_size: 10,
            summarize_batch_size: 10,
            embed_batch_size: 50,
        };
        Harness {
            controller: PipelineController::new(stages, config, Arc::clone(&accountant)),
            accountant,
            source,
            extractor,
            enricher,
            embedder,
        }
    }

    async fn wait_for_stage(controller: &PipelineController, stage: Stage) {
        let mut rx = controller.subscribe();
        rx.wait_for(|s| s.stage == Some(stage))
            .await
            .expect("controller alive");
    }

    #[tokio::test]
    async fn zero_work_run_goes_straight_to_embed() {
        let h = harness(0, true, ScriptedExtractor::default());
        h.accountant.add_tokens(99, 99);

        let outcome = h.controller.trigger(RefreshRequest::default());
        assert!(outcome.started);
        let done = h.controller.wait_until_idle().await;

        assert_eq!(
            done.history,
            vec![Stage::Fetch, Stage::Scrape, Stage::Embed, Stage::Done]
        );
        assert!(done.cost_estimate.is_none());
        assert!(done.actual_cost.is_none());
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 2);
        assert_eq!(h.accountant.get_tokens().input_tokens, 0);
        assert!(!h.controller.status().is_refreshing);
    }

    #[tokio::test]
    async fn batches_are_drained_until_empty() {
        let extractor = ScriptedExtractor {
            batches: Mutex::new(VecDeque::from([10, 10, 3])),
            ..Default::default()
        };
        let h = harness(0, true, extractor);

        h.controller.trigger(RefreshRequest::default());
        h.controller.wait_until_idle().await;

        assert_eq!(*h.extractor.limits.lock().unwrap(), vec![10, 10, 10, 10]);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn decline_skips_summarize() {
        let h = harness(25, true, ScriptedExtractor::default());

        let outcome = h.controller.trigger(RefreshRequest::default());
        wait_for_stage(&h.controller, Stage::Confirm).await;

        let status = h.controller.status();
        assert!(status.is_refreshing);
        let estimate = status.cost_estimate.expect("estimate published");
        assert_eq!(estimate.pending_item_count, 25);
        assert_eq!(Some(estimate.run_id), outcome.run_id);
        assert!((estimate.estimated_cost - 0.045).abs() < 1e-12);

        assert_eq!(h.controller.decline(), DecisionOutcome::Accepted);
        let done = h.controller.wait_until_idle().await;

        assert_eq!(
            done.history,
            vec![
                Stage::Fetch,
                Stage::Scrape,
                Stage::Confirm,
                Stage::Skipped,
                Stage::Embed,
                Stage::Done
            ]
        );
        assert!(done.actual_cost.is_none());
        assert!(done.cost_estimate.is_none());
        assert_eq!(h.enricher.processed.load(Ordering::SeqCst), 0);
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn approve_reports_actual_cost() {
        let h = harness(12, true, ScriptedExtractor::default());

        h.controller.trigger(RefreshRequest::default());
        wait_for_stage(&h.controller, Stage::Confirm).await;
        assert_eq!(h.controller.approve(), DecisionOutcome::Accepted);
        let done = h.controller.wait_until_idle().await;

        assert!(done.history.contains(&Stage::Summarize));
        let actual = done.actual_cost.expect("actual cost published");
        assert_eq!(actual.item_count, 12);
        assert_eq!(actual.input_tokens, 48_000);
        assert_eq!(actual.output_tokens, 6_000);
        // 12 * (4000 * 0.15 + 500 * 0.60) / 1e6
        assert!((actual.actual_cost - 0.0108).abs() < 1e-12);
        assert_eq!(actual.model, "gpt-4o-mini");
    }

    #[tokio::test(start_paused = true)]
    async fn silence_in_confirm_proceeds_after_timeout() {
        let h = harness(3, true, ScriptedExtractor::default());
        let started = tokio::time::Instant::now();

        h.controller.trigger(RefreshRequest::default());
        let done = h.controller.wait_until_idle().await;

        assert!(started.elapsed() >= Duration::from_secs(300));
        assert_eq!(
            done.history,
            vec![
                Stage::Fetch,
                Stage::Scrape,
                Stage::Confirm,
                Stage::Summarize,
                Stage::Embed,
                Stage::Done
            ]
        );
        assert_eq!(h.enricher.processed.load(Ordering::SeqCst), 3);
        assert_eq!(done.actual_cost.map(|a| a.item_count), Some(3));

        // The slot closed with the wait.
        assert_eq!(h.controller.approve(), DecisionOutcome::NoPendingDecision);
    }

    #[tokio::test]
    async fn missing_api_key_never_enters_confirm() {
        let h = harness(5, false, ScriptedExtractor::default());

        h.controller.trigger(RefreshRequest::default());
        let done = h.controller.wait_until_idle().await;

        assert_eq!(
            done.history,
            vec![
                Stage::Fetch,
                Stage::Scrape,
                Stage::Skipped,
                Stage::Embed,
                Stage::Done
            ]
        );
        assert_eq!(h.enricher.processed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn second_trigger_during_scrape_is_rejected() {
        let hold = Arc::new(Notify::new());
        let extractor = ScriptedExtractor {
            hold: Some(Arc::clone(&hold)),
            ..Default::default()
        };
        let h = harness(0, true, extractor);

        let first = h.controller.trigger(RefreshRequest::default());
        assert_eq!(first.run_id, Some(RunId(1)));
        wait_for_stage(&h.controller, Stage::Scrape).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = h.controller.trigger(RefreshRequest::default());
        assert!(!second.started);
        assert!(second.run_id.is_none());
        assert!(h.controller.status().is_refreshing);

        hold.notify_one();
        h.controller.wait_until_idle().await;

        let third = h.controller.trigger(RefreshRequest::default());
        assert_eq!(third.run_id, Some(RunId(2)));
        h.controller.wait_until_idle().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_start_exactly_one_run() {
        let hold = Arc::new(Notify::new());
        let extractor = ScriptedExtractor {
            hold: Some(Arc::clone(&hold)),
            ..Default::default()
        };
        let h = harness(0, true, extractor);

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let controller = Arc::clone(&h.controller);
            tasks.spawn(async move { controller.trigger(RefreshRequest::default()).started });
        }
        let mut started = 0;
        while let Some(result) = tasks.join_next().await {
            if result.expect("trigger task") {
                started += 1;
            }
        }
        assert_eq!(started, 1);

        hold.notify_one();
        let done = h.controller.wait_until_idle().await;
        assert_eq!(done.stage, Some(Stage::Done));
    }

    #[tokio::test]
    async fn stage_error_ends_run_and_releases_gate() {
        let extractor = ScriptedExtractor {
            fail: true,
            ..Default::default()
        };
        let h = harness(4, true, extractor);

        h.controller.trigger(RefreshRequest::default());
        let done = h.controller.wait_until_idle().await;

        assert_eq!(
            done.history,
            vec![Stage::Fetch, Stage::Scrape, Stage::Error]
        );
        assert!(done.last_error.unwrap().contains("connection reset"));
        assert_eq!(h.embedder.calls.load(Ordering::SeqCst), 0);
        assert!(!h.controller.status().is_refreshing);
        assert!(h.controller.trigger(RefreshRequest::default()).started);
        h.controller.wait_until_idle().await;
    }

    #[tokio::test]
    async fn panicking_stage_ends_run_in_error() {
        let embedder = CountingEmbedder {
            panic: true,
            ..Default::default()
        };
        let h = harness_with(0, true, ScriptedExtractor::default(), embedder);

        h.controller.trigger(RefreshRequest::default());
        let done = h.controller.wait_until_idle().await;

        assert_eq!(done.stage, Some(Stage::Error));
        assert_eq!(done.history[done.history.len() - 2], Stage::Embed);
        assert!(!h.controller.status().is_refreshing);
    }

    #[tokio::test]
    async fn decisions_for_other_runs_are_stale() {
        let h = harness(2, true, ScriptedExtractor::default());

        let run = h.controller.trigger(RefreshRequest::default()).run_id.unwrap();
        wait_for_stage(&h.controller, Stage::Confirm).await;

        assert_eq!(
            h.controller.decide_for(RunId(run.0 + 7), CostDecision::Approved),
            DecisionOutcome::StaleRun
        );
        assert_eq!(h.controller.status().stage, Some(Stage::Confirm));
        assert_eq!(
            h.controller.decide_for(run, CostDecision::Declined),
            DecisionOutcome::Accepted
        );
        let done = h.controller.wait_until_idle().await;
        assert!(done.history.contains(&Stage::Skipped));
    }

    #[tokio::test]
    async fn decisions_outside_confirm_are_rejected() {
        let h = harness(0, true, ScriptedExtractor::default());
        assert_eq!(h.controller.approve(), DecisionOutcome::NoPendingDecision);
        assert_eq!(h.controller.decline(), DecisionOutcome::NoPendingDecision);
        assert_eq!(h.controller.status(), RefreshStatus::default());
    }

    #[tokio::test]
    async fn actual_cost_is_dismissed_and_cleared_by_next_run() {
        let h = harness(1, true, ScriptedExtractor::default());

        h.controller.trigger(RefreshRequest::default());
        wait_for_stage(&h.controller, Stage::Confirm).await;
        h.controller.approve();
        h.controller.wait_until_idle().await;
        assert!(h.controller.status().actual_cost.is_some());

        assert!(h.controller.dismiss_actual_cost());
        assert!(h.controller.status().actual_cost.is_none());
        assert!(!h.controller.dismiss_actual_cost());
        assert_eq!(h.controller.status().stage, Some(Stage::Done));

        h.enricher.pending.store(1, Ordering::SeqCst);
        h.controller.trigger(RefreshRequest::default());
        wait_for_stage(&h.controller, Stage::Confirm).await;
        h.controller.approve();
        h.controller.wait_until_idle().await;
        h.controller.trigger(RefreshRequest::default());
        let done = h.controller.wait_until_idle().await;
        assert!(done.actual_cost.is_none());
    }
}
