//! Tiered conflict resolver.
//!
//! Tiers are tried in order until one lands a commit:
//! 1. clean-merge   — `git merge --no-ff`
//! 2. content-wins  — take the incoming side of every conflicted file
//! 3. ai-assist     — provider resolves each file's conflict markers
//! 4. reimagine     — provider rewrites each file from intent + diffs
//!
//! Every tier starts from a fresh merge attempt; a failed strategy aborts
//! its half-finished merge before the next tier runs.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::history::ConflictHistory;
use crate::agents::provider::{strip_code_fence, ProviderClient};
use crate::config::MergeConfig;
use crate::git::GitCli;
use crate::store::{MergeEntry, ResolveTier};

/// Result of resolving one queue entry.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MergeOutcome {
    pub success: bool,
    pub tier: Option<ResolveTier>,
    pub branch_name: String,
    pub conflict_files: Vec<String>,
    pub error_message: Option<String>,
}

impl MergeOutcome {
    fn success(branch: &str, tier: ResolveTier, conflict_files: Vec<String>) -> Self {
        Self {
            success: true,
            tier: Some(tier),
            branch_name: branch.to_string(),
            conflict_files,
            error_message: None,
        }
    }

    fn failure(
        branch: &str,
        tier: Option<ResolveTier>,
        conflict_files: Vec<String>,
        error: String,
    ) -> Self {
        Self {
            success: false,
            tier,
            branch_name: branch.to_string(),
            conflict_files,
            error_message: Some(error),
        }
    }
}

pub struct Resolver<'a> {
    repo: &'a Path,
    config: &'a MergeConfig,
    provider: Option<&'a dyn ProviderClient>,
    history: &'a mut ConflictHistory,
}

impl<'a> Resolver<'a> {
    pub fn new(
        repo: &'a Path,
        config: &'a MergeConfig,
        provider: Option<&'a dyn ProviderClient>,
        history: &'a mut ConflictHistory,
    ) -> Self {
        Self {
            repo,
            config,
            provider,
            history,
        }
    }

    /// Merge `entry.branch_name` into the currently checked-out target.
    pub async fn resolve(&mut self, entry: &MergeEntry, target: &str) -> MergeOutcome {
        let branch = &entry.branch_name;
        let message = format!("merge {branch} into {target}");

        // Tier 1: clean merge.
        match GitCli::merge_no_ff(self.repo, branch, &message).await {
            Ok(true) => {
                info!(%branch, "clean merge");
                return MergeOutcome::success(branch, ResolveTier::CleanMerge, Vec::new());
            }
            Ok(false) => {}
            Err(e) => {
                return MergeOutcome::failure(branch, None, Vec::new(), e.to_string());
            }
        }

        let conflict_files = match GitCli::conflicted_files(self.repo).await {
            Ok(files) => files,
            Err(e) => {
                let _ = GitCli::merge_abort(self.repo).await;
                return MergeOutcome::failure(branch, None, Vec::new(), e.to_string());
            }
        };
        info!(%branch, files = conflict_files.len(), "merge conflict, escalating tiers");
        for file in &conflict_files {
            self.history.record(file, ResolveTier::CleanMerge, false);
        }

        let mut last_error = String::from("all resolver tiers failed");
        // None until an escalation tier actually runs; clean-merge only
        // detected the conflict
        let mut last_tier: Option<ResolveTier> = None;

        for tier in [
            ResolveTier::ContentWins,
            ResolveTier::AiAssist,
            ResolveTier::Reimagine,
        ] {
            if !self.tier_enabled(tier) {
                continue;
            }
            if self.history.should_skip(&conflict_files, tier) {
                debug!(tier = %tier, "skipping tier with losing history on these files");
                continue;
            }
            last_tier = Some(tier);

            match self.attempt_tier(tier, entry, target, &conflict_files).await {
                Ok(()) => {
                    for file in &conflict_files {
                        self.history.record(file, tier, true);
                    }
                    return MergeOutcome::success(branch, tier, conflict_files);
                }
                Err(e) => {
                    warn!(tier = %tier, error = %e, "tier failed");
                    for file in &conflict_files {
                        self.history.record(file, tier, false);
                    }
                    last_error = e;
                    let _ = GitCli::merge_abort(self.repo).await;
                }
            }
        }

        // the tier-1 merge is still in progress when every escalation tier
        // was skipped or disabled; never hand back a wedged checkout
        let _ = GitCli::merge_abort(self.repo).await;
        MergeOutcome::failure(branch, last_tier, conflict_files, last_error)
    }

    fn tier_enabled(&self, tier: ResolveTier) -> bool {
        match tier {
            ResolveTier::CleanMerge | ResolveTier::ContentWins => true,
            ResolveTier::AiAssist => self.config.ai_resolve_enabled && self.provider.is_some(),
            ResolveTier::Reimagine => self.config.reimagine_enabled && self.provider.is_some(),
        }
    }

    /// Run one strategy on a fresh conflicted merge. The caller aborts the
    /// merge on failure.
    async fn attempt_tier(
        &mut self,
        tier: ResolveTier,
        entry: &MergeEntry,
        target: &str,
        conflict_files: &[String],
    ) -> std::result::Result<(), String> {
        if self.ensure_conflicted_merge(entry, target).await? {
            // the re-merge landed cleanly; nothing left for the strategy
            return Ok(());
        }

        match tier {
            ResolveTier::ContentWins => self.apply_content_wins(conflict_files).await,
            ResolveTier::AiAssist => self.apply_ai_assist(entry, conflict_files).await,
            ResolveTier::Reimagine => self.apply_reimagine(entry, target, conflict_files).await,
            ResolveTier::CleanMerge => Err("clean-merge is not a retryable strategy".to_string()),
        }?;

        let message = format!(
            "merge {} into {} ({})",
            entry.branch_name,
            target,
            tier.as_str()
        );
        GitCli::commit(self.repo, &message)
            .await
            .map_err(|e| e.to_string())
    }

    /// Re-run the merge if a previous tier aborted it. Returns `true` when
    /// the merge committed cleanly on the retry.
    async fn ensure_conflicted_merge(
        &self,
        entry: &MergeEntry,
        target: &str,
    ) -> std::result::Result<bool, String> {
        let in_conflict = GitCli::conflicted_files(self.repo)
            .await
            .map(|files| !files.is_empty())
            .unwrap_or(false);
        if in_conflict {
            return Ok(false);
        }
        let message = format!("merge {} into {}", entry.branch_name, target);
        GitCli::merge_no_ff(self.repo, &entry.branch_name, &message)
            .await
            .map_err(|e| e.to_string())
    }

    /// Take the incoming (merged-in) version of every conflicted file.
    /// Intended for fleets where each agent owns a disjoint file scope.
    async fn apply_content_wins(
        &self,
        conflict_files: &[String],
    ) -> std::result::Result<(), String> {
        for file in conflict_files {
            GitCli::checkout_theirs(self.repo, file)
                .await
                .map_err(|e| format!("{file}: {e}"))?;
            GitCli::add(self.repo, file)
                .await
                .map_err(|e| format!("{file}: {e}"))?;
        }
        Ok(())
    }

    /// Hand each file's conflict markers to the provider and apply its
    /// resolution.
    async fn apply_ai_assist(
        &mut self,
        entry: &MergeEntry,
        conflict_files: &[String],
    ) -> std::result::Result<(), String> {
        let provider = self.provider.ok_or("no provider configured")?;
        let hints = self.history.hints_for(conflict_files);

        for file in conflict_files {
            let path = self.repo.join(file);
            let conflicted = std::fs::read_to_string(&path)
                .map_err(|e| format!("cannot read {file}: {e}"))?;

            let mut prompt = format!(
                "You are resolving a git merge conflict in `{file}` for task {}.\n\
                 Reply with ONLY the complete resolved file content, no commentary.\n",
                entry.bead_id
            );
            if !hints.is_empty() {
                prompt.push_str("Prior resolutions of these files:\n");
                for hint in &hints {
                    prompt.push_str(&format!("- {hint}\n"));
                }
            }
            prompt.push_str("\nConflicted content:\n");
            prompt.push_str(&conflicted);

            let response = provider
                .complete(&prompt)
                .await
                .map_err(|e| format!("{file}: provider failed: {e}"))?;
            let resolved = strip_code_fence(&response);
            if resolved.contains("<<<<<<<") {
                return Err(format!("{file}: provider left conflict markers in place"));
            }

            write_resolved(&path, &resolved).map_err(|e| format!("{file}: {e}"))?;
            GitCli::add(self.repo, file)
                .await
                .map_err(|e| format!("{file}: {e}"))?;
        }
        Ok(())
    }

    /// Describe the intent and both sides' diffs; take the provider's full
    /// rewrite of each file.
    async fn apply_reimagine(
        &self,
        entry: &MergeEntry,
        target: &str,
        conflict_files: &[String],
    ) -> std::result::Result<(), String> {
        let provider = self.provider.ok_or("no provider configured")?;

        for file in conflict_files {
            let incoming_diff =
                GitCli::diff_for_file(self.repo, target, &entry.branch_name, file)
                    .await
                    .unwrap_or_default();
            let target_version = GitCli::show_file(self.repo, target, file)
                .await
                .unwrap_or_default();

            let prompt = format!(
                "Agent '{}' finished task {} on branch {} and its changes to `{file}` \
                 conflict with `{target}`.\n\
                 Rewrite the file so both intents are preserved.\n\
                 Reply with ONLY the complete new file content.\n\n\
                 Current `{target}` version:\n{target_version}\n\n\
                 Incoming change:\n{incoming_diff}\n",
                entry.agent_name, entry.bead_id, entry.branch_name,
            );

            let response = provider
                .complete(&prompt)
                .await
                .map_err(|e| format!("{file}: provider failed: {e}"))?;
            let resolved = strip_code_fence(&response);

            write_resolved(&self.repo.join(file), &resolved)
                .map_err(|e| format!("{file}: {e}"))?;
            GitCli::add(self.repo, file)
                .await
                .map_err(|e| format!("{file}: {e}"))?;
        }
        Ok(())
    }
}

fn write_resolved(path: &PathBuf, content: &str) -> std::io::Result<()> {
    let mut body = content.to_string();
    if !body.ends_with('\n') {
        body.push('\n');
    }
    std::fs::write(path, body)
}
