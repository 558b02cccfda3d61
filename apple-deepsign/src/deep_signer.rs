// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Deep signing of a bundle and everything nested inside it.

use {
    crate::{
        classifier::SignatureInspector,
        code_item::ItemId,
        error::DeepSignError,
        executor::{SigningExecutor, SigningPrimitive},
        order::resolve_order,
        policy::{EdgeCasePolicy, SigningPlan},
        report::{ExecutionRecord, Report, ReportAggregator},
        signing_settings::SigningSettings,
        walker::{WalkResult, Walker},
    },
    log::{info, warn},
    std::{
        path::{Path, PathBuf},
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    },
};

/// A shareable request to stop signing between items.
#[derive(Clone, Debug, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A root whose items have been discovered, ordered and decided.
#[derive(Clone, Debug)]
pub struct PreparedRoot {
    pub root: PathBuf,
    pub walk: WalkResult,
    pub order: Vec<ItemId>,
    pub plan: SigningPlan,
}

/// Signs a bundle tree leaves first.
pub struct DeepSigner<'a> {
    settings: &'a SigningSettings,
    inspector: &'a dyn SignatureInspector,
    primitive: &'a dyn SigningPrimitive,
    cancellation: CancellationFlag,
}

impl<'a> DeepSigner<'a> {
    pub fn new(
        settings: &'a SigningSettings,
        inspector: &'a dyn SignatureInspector,
        primitive: &'a dyn SigningPrimitive,
    ) -> Self {
        Self {
            settings,
            inspector,
            primitive,
            cancellation: CancellationFlag::default(),
        }
    }

    /// Use an externally controlled cancellation flag.
    pub fn with_cancellation(mut self, flag: CancellationFlag) -> Self {
        self.cancellation = flag;
        self
    }

    /// Discover the code items under `root` without deciding anything.
    pub fn discover(&self, root: &Path) -> Result<WalkResult, DeepSignError> {
        Walker::new(self.settings, self.inspector).walk(root)
    }

    /// Discover, order and decide. Nothing is written.
    pub fn prepare(&self, root: &Path) -> Result<PreparedRoot, DeepSignError> {
        let walk = self.discover(root)?;
        let order = resolve_order(&walk.tree)?;
        let plan = EdgeCasePolicy::new(self.settings).plan(&walk.tree, &order);

        info!(
            "{}: {} code items, {} to sign",
            root.display(),
            plan.len(),
            plan.write_count()
        );

        Ok(PreparedRoot {
            root: root.to_path_buf(),
            walk,
            order,
            plan,
        })
    }

    /// Carry out a prepared plan.
    pub fn execute(&self, prepared: &PreparedRoot) -> Report {
        let mut aggregator = ReportAggregator::new(&prepared.root);

        for failure in &prepared.walk.inspection_failures {
            aggregator.record(ExecutionRecord::inspection_failure(failure));
        }

        let executor = SigningExecutor::new(self.settings, self.primitive);
        let mut cancelled = false;

        for entry in &prepared.plan.entries {
            let item = match prepared.walk.tree.get(entry.item) {
                Some(item) => item,
                None => continue,
            };

            if !cancelled && self.cancellation.is_cancelled() {
                warn!("cancellation requested; not signing remaining items");
                cancelled = true;
                aggregator.mark_cancelled();
            }

            aggregator.record(if cancelled {
                ExecutionRecord::not_attempted(item, entry)
            } else {
                executor.execute(item, entry)
            });
        }

        aggregator.finish()
    }

    /// Sign `root` and everything nested inside it.
    pub fn sign(&self, root: &Path) -> Result<Report, DeepSignError> {
        let prepared = self.prepare(root)?;

        Ok(self.execute(&prepared))
    }
}
