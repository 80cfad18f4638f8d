//! Merge engine: dequeues `merge_ready` branches FIFO and integrates them
//! into the target branch. The canonical branch is written only here.

use std::path::PathBuf;

use tracing::{info, warn};

use super::history::ConflictHistory;
use super::resolver::{MergeOutcome, Resolver};
use crate::agents::provider::ProviderClient;
use crate::agents::{parse_worker_branch, BRANCH_PREFIX};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::git::GitCli;
use crate::mail::{MailBroker, SendRequest};
use crate::paths::{self, OverstoryHome};
use crate::store::{
    MailPriority, MailType, MergeEntry, MergeQueue, MergeStatus, ResolveTier,
};

pub struct MergeEngine {
    home: OverstoryHome,
    config: Config,
    repo: PathBuf,
}

impl MergeEngine {
    pub fn new(home: OverstoryHome, config: Config) -> Self {
        let repo = config.project_root();
        Self { home, config, repo }
    }

    /// Merge target precedence: `--into` > `session-branch.txt` >
    /// `project.canonicalBranch`.
    pub fn resolve_target(&self, into: Option<&str>) -> String {
        if let Some(target) = into {
            return target.to_string();
        }
        if let Some(target) = paths::read_pointer(&self.home.session_branch_file()) {
            return target;
        }
        self.config.project.canonical_branch.clone()
    }

    /// Process every pending entry, oldest first, one at a time.
    pub async fn process_queue(
        &self,
        into: Option<&str>,
        provider: Option<&dyn ProviderClient>,
    ) -> Result<Vec<MergeOutcome>> {
        let queue = MergeQueue::open(&self.home.merge_queue_db())?;
        let pending = queue.list(Some(MergeStatus::Pending))?;
        queue.close();

        let mut outcomes = Vec::with_capacity(pending.len());
        for entry in pending {
            outcomes.push(self.process_entry(&entry, into, provider).await?);
        }
        Ok(outcomes)
    }

    /// Merge one branch that may or may not already be queued. Verifies the
    /// ref, derives agent/bead from the branch name, detects modified
    /// files, enqueues, then resolves. An already-merged entry reports
    /// `merged` without touching git.
    pub async fn merge_branch(
        &self,
        branch: &str,
        into: Option<&str>,
        provider: Option<&dyn ProviderClient>,
    ) -> Result<MergeOutcome> {
        let queue = MergeQueue::open(&self.home.merge_queue_db())?;
        if let Some(existing) = queue.get(branch)? {
            if existing.status == MergeStatus::Merged {
                queue.close();
                return Ok(MergeOutcome {
                    success: true,
                    tier: existing.resolved_tier,
                    branch_name: branch.to_string(),
                    conflict_files: Vec::new(),
                    error_message: None,
                });
            }
            queue.close();
            return self.process_entry(&existing, into, provider).await;
        }
        queue.close();

        if !GitCli::branch_exists(&self.repo, branch)
            .await
            .map_err(|e| Error::Merge(e.to_string()))?
        {
            return Err(Error::Merge(format!("branch '{branch}' does not exist")));
        }

        let (agent_name, bead_id) = parse_worker_branch(branch).ok_or_else(|| {
            Error::Merge(format!(
                "branch '{branch}' does not match {BRANCH_PREFIX}{{agent}}/{{bead}}"
            ))
        })?;

        let target = self.resolve_target(into);
        let files = GitCli::diff_name_only(&self.repo, &target, branch)
            .await
            .map_err(|e| Error::Merge(e.to_string()))?;

        let queue = MergeQueue::open(&self.home.merge_queue_db())?;
        let entry = queue.enqueue(branch, bead_id, agent_name, &files)?;
        queue.close();

        self.process_entry(&entry, into, provider).await
    }

    async fn process_entry(
        &self,
        entry: &MergeEntry,
        into: Option<&str>,
        provider: Option<&dyn ProviderClient>,
    ) -> Result<MergeOutcome> {
        let target = self.resolve_target(into);

        if GitCli::is_dirty(&self.repo)
            .await
            .map_err(|e| Error::Merge(e.to_string()))?
        {
            return Err(Error::Merge(format!(
                "primary checkout at {} has uncommitted changes; commit or stash before merging",
                self.repo.display()
            )));
        }
        GitCli::checkout(&self.repo, &target)
            .await
            .map_err(|e| Error::Merge(format!("cannot checkout '{target}': {e}")))?;

        let queue = MergeQueue::open(&self.home.merge_queue_db())?;
        queue.update_status(&entry.branch_name, MergeStatus::Merging, None)?;
        queue.close();

        let mut history = ConflictHistory::load(&self.home);
        let outcome = {
            let mut resolver =
                Resolver::new(&self.repo, &self.config.merge, provider, &mut history);
            resolver.resolve(entry, &target).await
        };
        if let Err(e) = history.save() {
            warn!(error = %e, "could not persist conflict history");
        }

        let queue = MergeQueue::open(&self.home.merge_queue_db())?;
        if outcome.success {
            queue.update_status(&entry.branch_name, MergeStatus::Merged, outcome.tier)?;
        } else {
            queue.update_status(&entry.branch_name, MergeStatus::Conflict, outcome.tier)?;
        }
        queue.close();

        info!(
            branch = %entry.branch_name,
            success = outcome.success,
            tier = outcome.tier.map(ResolveTier::as_str),
            "merge finished"
        );
        self.notify_agent(entry, &outcome);
        Ok(outcome)
    }

    /// Best-effort `merged` / `merge_failed` mail back to the branch
    /// owner; merging never fails because notification did.
    fn notify_agent(&self, entry: &MergeEntry, outcome: &MergeOutcome) {
        let Ok(broker) = MailBroker::open(&self.home) else {
            return;
        };
        let (mail_type, subject, body) = if outcome.success {
            (
                MailType::Merged,
                format!("merged: {}", entry.branch_name),
                format!(
                    "Branch {} merged via {}.",
                    entry.branch_name,
                    outcome
                        .tier
                        .map_or("unknown tier", ResolveTier::as_str)
                ),
            )
        } else {
            (
                MailType::MergeFailed,
                format!("merge failed: {}", entry.branch_name),
                format!(
                    "Branch {} could not be merged: {}\nConflicting files: {}",
                    entry.branch_name,
                    outcome.error_message.as_deref().unwrap_or("unknown"),
                    outcome.conflict_files.join(", ")
                ),
            )
        };
        let _ = broker.send(&SendRequest {
            from: "overstory".to_string(),
            to: entry.agent_name.clone(),
            subject,
            body,
            mail_type,
            priority: MailPriority::Normal,
            payload: None,
        });
        broker.close();
    }
}
