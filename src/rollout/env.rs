//! Task records, prompt sets, and the environment collaborator interface.
//!
//! The environment is an external collaborator: tool execution, reward
//! rules and goal detection live outside this crate. The orchestrator only
//! needs one per-turn call, [`Environment::respond`], judging the latest
//! completion in the context of the task and the turns so far.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::sync::snapshot::Fnv1a;

use super::trajectory::Turn;

// ---------------------------------------------------------------------------
// Dataset records
// ---------------------------------------------------------------------------

/// One prompt/task drawn from the dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Stable identifier within the dataset.
    pub id: String,
    /// The prompt the rollout starts from.
    pub prompt: String,
    /// Task-specific extras (tool specs, gold answers, ...), opaque here.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl TaskRecord {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            prompt: prompt.into(),
            metadata: serde_json::Value::Null,
        }
    }
}

/// In-memory prompt collection with train and held-out eval splits.
///
/// Dataset storage and tokenization are external concerns; this is the
/// already-loaded form the loop consumes, plus a JSON convenience loader
/// for the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptSet {
    train: Vec<TaskRecord>,
    eval: Vec<TaskRecord>,
}

impl PromptSet {
    pub fn new(train: Vec<TaskRecord>, eval: Vec<TaskRecord>) -> Self {
        Self { train, eval }
    }

    /// Load `{ "train": [...], "eval": [...] }` from a JSON file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let set = serde_json::from_str(&text)?;
        Ok(set)
    }

    /// Deterministic synthetic prompts for mock runs and tests.
    pub fn synthetic(n_train: usize, n_eval: usize) -> Self {
        let templates = [
            "Arrange the listed tools by size and report the order",
            "Find the faulty sensor in the rack and disable it",
            "Summarize the incident log and flag the root cause",
            "Plan a three-step route through the depicted maze",
        ];
        let make = |prefix: &str, n: usize| {
            (0..n)
                .map(|i| {
                    TaskRecord::new(
                        format!("{prefix}-{i:03}"),
                        format!("{} (variant {i})", templates[i % templates.len()]),
                    )
                })
                .collect()
        };
        Self {
            train: make("task", n_train),
            eval: make("eval", n_eval),
        }
    }

    pub fn train_len(&self) -> usize {
        self.train.len()
    }

    pub fn eval_len(&self) -> usize {
        self.eval.len()
    }

    /// The training prompts for one step: a deterministic round-robin
    /// window over the train split.
    pub fn train_batch(&self, step: u64, n: usize) -> Vec<TaskRecord> {
        if self.train.is_empty() || n == 0 {
            return Vec::new();
        }
        let len = self.train.len();
        let start = (step as usize * n) % len;
        (0..n.min(len))
            .map(|i| self.train[(start + i) % len].clone())
            .collect()
    }

    /// The first `n` held-out prompts, same set every eval.
    pub fn eval_batch(&self, n: usize) -> Vec<TaskRecord> {
        self.eval.iter().take(n).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Environment collaborator
// ---------------------------------------------------------------------------

/// Feedback for one completed turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnFeedback {
    /// The observation folded into the next turn's context.
    pub observation: String,
    /// Scalar reward for this turn.
    pub reward: f64,
    /// Whether the trajectory is over.
    pub done: bool,
    /// Whether the goal was reached. Only meaningful when `done`.
    pub success: bool,
}

impl TurnFeedback {
    /// Neutral feedback: keep going.
    pub fn proceed(observation: impl Into<String>) -> Self {
        Self {
            observation: observation.into(),
            reward: 0.0,
            done: false,
            success: false,
        }
    }

    /// Terminal success with the given reward.
    pub fn goal(observation: impl Into<String>, reward: f64) -> Self {
        Self {
            observation: observation.into(),
            reward,
            done: true,
            success: true,
        }
    }

    /// Terminal failure, e.g. an unrecoverable tool error.
    pub fn failed(observation: impl Into<String>) -> Self {
        Self {
            observation: observation.into(),
            reward: 0.0,
            done: true,
            success: false,
        }
    }
}

/// The environment collaborator: one pure call per completed turn.
#[allow(async_fn_in_trait)]
pub trait Environment: Send + Sync {
    /// Judge the latest completion for `task`, given the turns so far.
    ///
    /// The call must not retain episode state between invocations; all the
    /// context it may use is in its arguments.
    async fn respond(
        &self,
        task: &TaskRecord,
        history: &[Turn],
        completion: &str,
    ) -> anyhow::Result<TurnFeedback>;
}

// ---------------------------------------------------------------------------
// Scripted environment (tests, mock mode)
// ---------------------------------------------------------------------------

/// Environment that replays per-task scripts keyed by turn index.
///
/// Tasks without a script run neutrally until the orchestrator's turn cap.
/// `error_on` makes one specific turn return an `Err`, for exercising the
/// collaborator-failure path.
#[derive(Default)]
pub struct ScriptedEnv {
    scripts: HashMap<String, Vec<TurnFeedback>>,
    errors: Vec<(String, usize)>,
}

impl ScriptedEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every task succeeds on its `turns`-th turn with reward 1.0.
    pub fn succeed_after(turns: usize) -> SucceedAfterEnv {
        SucceedAfterEnv { turns }
    }

    /// Script the outcomes of one task, one entry per turn.
    pub fn script_task(mut self, task_id: impl Into<String>, outcomes: Vec<TurnFeedback>) -> Self {
        self.scripts.insert(task_id.into(), outcomes);
        self
    }

    /// Make `respond` fail with an error on one specific turn of a task.
    pub fn error_on(mut self, task_id: impl Into<String>, turn_index: usize) -> Self {
        self.errors.push((task_id.into(), turn_index));
        self
    }
}

impl Environment for ScriptedEnv {
    async fn respond(
        &self,
        task: &TaskRecord,
        history: &[Turn],
        _completion: &str,
    ) -> anyhow::Result<TurnFeedback> {
        let turn_index = history.len();
        if self
            .errors
            .iter()
            .any(|(id, turn)| id == &task.id && *turn == turn_index)
        {
            anyhow::bail!("scripted tool failure on task {} turn {turn_index}", task.id);
        }

        if let Some(outcomes) = self.scripts.get(&task.id) {
            if let Some(outcome) = outcomes.get(turn_index) {
                return Ok(outcome.clone());
            }
        }
        Ok(TurnFeedback::proceed(format!(
            "turn {turn_index} acknowledged"
        )))
    }
}

/// Environment where every task succeeds after a fixed number of turns.
pub struct SucceedAfterEnv {
    turns: usize,
}

impl Environment for SucceedAfterEnv {
    async fn respond(
        &self,
        _task: &TaskRecord,
        history: &[Turn],
        _completion: &str,
    ) -> anyhow::Result<TurnFeedback> {
        let turn_index = history.len();
        if turn_index + 1 >= self.turns {
            Ok(TurnFeedback::goal("goal reached", 1.0))
        } else {
            Ok(TurnFeedback::proceed(format!(
                "turn {turn_index} acknowledged"
            )))
        }
    }
}

/// Environment that scores the completion content itself: the goal is
/// reached when the completion hash clears a threshold. Gives mock runs
/// reward variation across samples without real tools.
pub struct HashScoredEnv {
    /// Roughly `1/modulus` of completions succeed per turn.
    modulus: u64,
}

impl HashScoredEnv {
    pub fn new(modulus: u64) -> Self {
        Self {
            modulus: modulus.max(1),
        }
    }
}

impl Environment for HashScoredEnv {
    async fn respond(
        &self,
        task: &TaskRecord,
        history: &[Turn],
        completion: &str,
    ) -> anyhow::Result<TurnFeedback> {
        let mut hash = Fnv1a::new();
        hash.write(task.id.as_bytes());
        hash.write(completion.as_bytes());
        if hash.finish() % self.modulus == 0 {
            Ok(TurnFeedback::goal("task solved", 1.0))
        } else {
            Ok(TurnFeedback::proceed(format!(
                "attempt {} noted, keep going",
                history.len()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(index: usize) -> Turn {
        Turn {
            prompt: "p".into(),
            completion: "c".into(),
            observation: Some("o".into()),
            reward: 0.0,
            turn_index: index,
            weight_version: 0,
            tokens: 1,
        }
    }

    #[test]
    fn test_prompt_set_round_robin_batches() {
        let set = PromptSet::synthetic(5, 2);
        assert_eq!(set.train_len(), 5);
        assert_eq!(set.eval_len(), 2);

        let step0 = set.train_batch(0, 2);
        let step1 = set.train_batch(1, 2);
        assert_eq!(step0[0].id, "task-000");
        assert_eq!(step1[0].id, "task-002");

        // Wraps around the end of the split.
        let step2 = set.train_batch(2, 2);
        assert_eq!(step2[0].id, "task-004");
        assert_eq!(step2[1].id, "task-000");
    }

    #[test]
    fn test_eval_batch_is_stable() {
        let set = PromptSet::synthetic(3, 4);
        let a = set.eval_batch(2);
        let b = set.eval_batch(2);
        assert_eq!(a[0].id, b[0].id);
        assert_eq!(a[1].id, b[1].id);
    }

    #[test]
    fn test_prompt_set_loads_from_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prompts.json");
        std::fs::write(
            &path,
            r#"{
                "train": [
                    {"id": "t0", "prompt": "sort the inbox"},
                    {"id": "t1", "prompt": "file the report", "metadata": {"gold": "done"}}
                ],
                "eval": [
                    {"id": "e0", "prompt": "close the ticket"}
                ]
            }"#,
        )
        .unwrap();

        let set = PromptSet::from_json_file(&path).unwrap();
        assert_eq!(set.train_len(), 2);
        assert_eq!(set.eval_len(), 1);
        assert_eq!(set.train_batch(0, 2)[1].id, "t1");
        assert_eq!(set.train_batch(0, 2)[1].metadata["gold"], "done");

        assert!(PromptSet::from_json_file(&dir.path().join("missing.json")).is_err());
    }

    #[tokio::test]
    async fn test_scripted_env_replays_outcomes() {
        let env = ScriptedEnv::new().script_task(
            "t1",
            vec![
                TurnFeedback::proceed("keep going"),
                TurnFeedback::goal("done", 1.0),
            ],
        );
        let task = TaskRecord::new("t1", "prompt");

        let first = env.respond(&task, &[], "a").await.unwrap();
        assert!(!first.done);

        let second = env.respond(&task, &[turn(0)], "b").await.unwrap();
        assert!(second.done && second.success);
        assert_eq!(second.reward, 1.0);
    }

    #[tokio::test]
    async fn test_scripted_env_error_injection() {
        let env = ScriptedEnv::new().error_on("t1", 1);
        let task = TaskRecord::new("t1", "prompt");

        assert!(env.respond(&task, &[], "a").await.is_ok());
        let err = env.respond(&task, &[turn(0)], "b").await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn test_succeed_after_env() {
        let env = ScriptedEnv::succeed_after(2);
        let task = TaskRecord::new("t1", "prompt");

        let first = env.respond(&task, &[], "a").await.unwrap();
        assert!(!first.done);
        let second = env.respond(&task, &[turn(0)], "b").await.unwrap();
        assert!(second.done && second.success);
    }

    #[tokio::test]
    async fn test_hash_scored_env_is_deterministic() {
        let env = HashScoredEnv::new(2);
        let task = TaskRecord::new("t1", "prompt");

        let a = env.respond(&task, &[], "some completion").await.unwrap();
        let b = env.respond(&task, &[], "some completion").await.unwrap();
        assert_eq!(a.done, b.done);
        assert_eq!(a.reward, b.reward);
    }
}
