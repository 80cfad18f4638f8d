//! Merge engine end-to-end against real git repositories.

use std::process::{Command, Stdio};

use overstory::config::Config;
use overstory::merge::MergeEngine;
use overstory::paths::OverstoryHome;
use overstory::store::{MergeQueue, MergeStatus, ResolveTier};
use tempfile::TempDir;

fn init_project() -> (TempDir, OverstoryHome, Config) {
    let temp = TempDir::new().unwrap();
    let run = |args: &[&str]| {
        let status = Command::new("git")
            .args(args)
            .current_dir(temp.path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "Test"]);
    std::fs::create_dir_all(temp.path().join("src")).unwrap();
    std::fs::write(temp.path().join("src").join("a.ts"), "base\n").unwrap();
    std::fs::write(temp.path().join("src").join("shared.ts"), "base\n").unwrap();
    run(&["add", "-A"]);
    run(&["commit", "-m", "init"]);

    let home = OverstoryHome::at(temp.path());
    home.ensure_layout().unwrap();
    let mut config = Config::default();
    config.project.root = Some(temp.path().to_path_buf());
    config.project.name = "demo".to_string();
    (temp, home, config)
}

fn git(temp: &TempDir, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(temp.path())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .unwrap();
    assert!(status.success(), "git {args:?} failed");
}

#[tokio::test]
async fn clean_merge_scenario() {
    let (temp, home, config) = init_project();

    // branch modifies src/a.ts; canonical is untouched there
    git(&temp, &["checkout", "-b", "overstory/alice/task-1"]);
    std::fs::write(temp.path().join("src").join("a.ts"), "alice version\n").unwrap();
    git(&temp, &["add", "-A"]);
    git(&temp, &["commit", "-m", "alice edit"]);
    git(&temp, &["checkout", "main"]);

    let engine = MergeEngine::new(home.clone(), config);
    let outcome = engine
        .merge_branch("overstory/alice/task-1", None, None)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.tier, Some(ResolveTier::CleanMerge));

    // canonical now matches the branch's version
    let merged = std::fs::read_to_string(temp.path().join("src").join("a.ts")).unwrap();
    assert_eq!(merged, "alice version\n");
}

#[tokio::test]
async fn content_wins_conflict_scenario() {
    let (temp, home, config) = init_project();

    // both canonical and branch modify src/shared.ts
    git(&temp, &["checkout", "-b", "overstory/bob/task-2"]);
    std::fs::write(temp.path().join("src").join("shared.ts"), "bob version\n").unwrap();
    git(&temp, &["add", "-A"]);
    git(&temp, &["commit", "-m", "bob edit"]);
    git(&temp, &["checkout", "main"]);
    std::fs::write(temp.path().join("src").join("shared.ts"), "main version\n").unwrap();
    git(&temp, &["add", "-A"]);
    git(&temp, &["commit", "-m", "main edit"]);

    let engine = MergeEngine::new(home.clone(), config);
    let outcome = engine
        .merge_branch("overstory/bob/task-2", None, None)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.tier, Some(ResolveTier::ContentWins));
    assert_eq!(outcome.conflict_files, vec!["src/shared.ts"]);

    // the incoming (branch) side won
    let merged = std::fs::read_to_string(temp.path().join("src").join("shared.ts")).unwrap();
    assert_eq!(merged, "bob version\n");
}

#[tokio::test]
async fn fifo_queue_processing() {
    let (temp, home, config) = init_project();

    for (agent, file) in [("a", "one.ts"), ("b", "two.ts")] {
        git(&temp, &["checkout", "-b", &format!("overstory/{agent}/t")]);
        std::fs::write(temp.path().join(file), "x\n").unwrap();
        git(&temp, &["add", "-A"]);
        git(&temp, &["commit", "-m", "edit"]);
        git(&temp, &["checkout", "main"]);
    }

    let queue = MergeQueue::open(&home.merge_queue_db()).unwrap();
    queue.enqueue("overstory/a/t", "t", "a", &[]).unwrap();
    queue.enqueue("overstory/b/t", "t", "b", &[]).unwrap();
    queue.close();

    let engine = MergeEngine::new(home.clone(), config);
    let outcomes = engine.process_queue(None, None).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].branch_name, "overstory/a/t");
    assert_eq!(outcomes[1].branch_name, "overstory/b/t");
    assert!(outcomes.iter().all(|o| o.success));

    // pending list is empty afterwards
    let queue = MergeQueue::open(&home.merge_queue_db()).unwrap();
    assert!(queue.list(Some(MergeStatus::Pending)).unwrap().is_empty());
    queue.close();
}
