//! Event routing over declarative pipeline definitions.
//!
//! Pipelines are YAML documents in a `pipelines/` directory. An event
//! starts a new pipeline run when its type equals a pipeline's `on`
//! trigger, and advances an existing run to the immediately-next step
//! when the current job executed inside one. Matches are deterministic:
//! pipelines in file order, events in emission order.

use ductile_state_store::EventContext;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("duplicate pipeline name `{0}`")]
    DuplicatePipeline(String),

    #[error("pipeline `{pipeline}` has duplicate step id `{step}`")]
    DuplicateStep { pipeline: String, step: String },

    #[error("pipeline `{0}` has no steps")]
    EmptyPipeline(String),
}

/// One node of a pipeline.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub id: String,
    /// Plugin name this step binds to.
    pub uses: String,
    /// Step-scoped plugin configuration, merged over the manifest's.
    #[serde(default)]
    pub with: Map<String, Value>,
    /// Event-type predicate for inline chaining. Absent means any event
    /// emitted by the previous step advances the run.
    #[serde(default)]
    pub when: Option<String>,
    /// Clone the parent job's workspace instead of starting empty.
    #[serde(default)]
    pub clone: bool,
    /// Step-declared baggage, merged over the event payload into the
    /// child context.
    #[serde(default)]
    pub annotations: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Pipeline {
    pub name: String,
    /// Event type that starts a new run at the first step.
    pub on: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineFile {
    pipelines: Vec<Pipeline>,
}

/// A step selected for an event.
#[derive(Debug, Clone)]
pub struct MatchedStep<'a> {
    pub pipeline_name: &'a str,
    pub step: &'a Step,
}

impl MatchedStep<'_> {
    /// Baggage updates for the child context: event payload with the
    /// step's annotations merged on top.
    pub fn context_updates(&self, event_payload: &Map<String, Value>) -> Map<String, Value> {
        let mut updates = event_payload.clone();
        for (key, value) in &self.step.annotations {
            updates.insert(key.clone(), value.clone());
        }
        updates
    }
}

/// The rule engine mapping emitted events to next hops.
#[derive(Debug, Default)]
pub struct Router {
    pipelines: Vec<Pipeline>,
}

impl Router {
    pub fn new(pipelines: Vec<Pipeline>) -> Result<Self, RouterError> {
        let mut seen = std::collections::HashSet::new();
        for pipeline in &pipelines {
            if !seen.insert(pipeline.name.clone()) {
                return Err(RouterError::DuplicatePipeline(pipeline.name.clone()));
            }
            if pipeline.steps.is_empty() {
                return Err(RouterError::EmptyPipeline(pipeline.name.clone()));
            }
            let mut step_ids = std::collections::HashSet::new();
            for step in &pipeline.steps {
                if !step_ids.insert(step.id.clone()) {
                    return Err(RouterError::DuplicateStep {
                        pipeline: pipeline.name.clone(),
                        step: step.id.clone(),
                    });
                }
            }
        }
        Ok(Self { pipelines })
    }

    /// Load every `*.yaml`/`*.yml` under `pipelines_dir`, in sorted file
    /// order. A missing directory yields an empty router.
    pub fn load(pipelines_dir: &Path) -> Result<Self, RouterError> {
        let entries = match std::fs::read_dir(pipelines_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No pipelines directory at {}", pipelines_dir.display());
                return Self::new(Vec::new());
            }
            Err(source) => {
                return Err(RouterError::Io {
                    path: pipelines_dir.to_path_buf(),
                    source,
                })
            }
        };

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        files.sort();

        let mut pipelines = Vec::new();
        for path in files {
            let raw = std::fs::read_to_string(&path).map_err(|source| RouterError::Io {
                path: path.clone(),
                source,
            })?;
            let file: PipelineFile =
                serde_yaml::from_str(&raw).map_err(|source| RouterError::Parse {
                    path: path.clone(),
                    source,
                })?;
            pipelines.extend(file.pipelines);
        }

        let router = Self::new(pipelines)?;
        info!("Loaded {} pipeline(s)", router.pipelines.len());
        Ok(router)
    }

    /// Match an event against the rule set.
    ///
    /// Two ways in, both may fire:
    /// 1. The event type equals a pipeline's `on` trigger - the first
    ///    step of every such pipeline matches (a new run starts).
    /// 2. The emitting job executed inside a pipeline run (known from
    ///    its context row) - the immediately-next step of that pipeline
    ///    matches, unless its `when` predicate names a different type.
    pub fn match_event<'a>(
        &'a self,
        event_type: &str,
        current: Option<&'a EventContext>,
    ) -> Vec<MatchedStep<'a>> {
        let mut matches = Vec::new();

        if let Some(context) = current {
            if let Some(next) = self.next_step(&context.pipeline_name, &context.step_id) {
                let accepted = match &next.when {
                    None => true,
                    Some(trigger) => trigger == event_type,
                };
                if accepted {
                    matches.push(MatchedStep {
                        pipeline_name: &context.pipeline_name,
                        step: next,
                    });
                }
            }
        }

        for pipeline in &self.pipelines {
            if pipeline.on == event_type {
                matches.push(MatchedStep {
                    pipeline_name: &pipeline.name,
                    step: &pipeline.steps[0],
                });
            }
        }

        matches
    }

    /// Look up a step by pipeline and id (the dispatcher needs the
    /// `clone` flag and `with` config of the step a job is executing).
    pub fn step(&self, pipeline_name: &str, step_id: &str) -> Option<&Step> {
        self.pipelines
            .iter()
            .find(|p| p.name == pipeline_name)?
            .steps
            .iter()
            .find(|s| s.id == step_id)
    }

    fn next_step(&self, pipeline_name: &str, step_id: &str) -> Option<&Step> {
        let pipeline = self.pipelines.iter().find(|p| p.name == pipeline_name)?;
        let index = pipeline.steps.iter().position(|s| s.id == step_id)?;
        pipeline.steps.get(index + 1)
    }

    pub fn pipelines(&self) -> &[Pipeline] {
        &self.pipelines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ductile_ids::EventContextId;
    use serde_json::json;

    fn router() -> Router {
        let yaml = r#"
pipelines:
  - name: e2e-chain
    on: test.triggered
    steps:
      - id: processor
        uses: processor
        clone: true
      - id: notifier
        uses: notifier
        when: video.processed
        annotations:
          notified_via: pipeline
  - name: audit
    on: test.triggered
    steps:
      - id: log-it
        uses: auditor
"#;
        let file: PipelineFile = serde_yaml::from_str(yaml).unwrap();
        Router::new(file.pipelines).unwrap()
    }

    fn context(pipeline: &str, step: &str) -> EventContext {
        EventContext {
            id: EventContextId::new(),
            parent_id: None,
            pipeline_name: pipeline.to_string(),
            step_id: step.to_string(),
            accumulated: Map::new(),
            created_at: String::new(),
        }
    }

    #[test]
    fn trigger_event_starts_all_matching_pipelines_in_order() {
        let router = router();
        let matches = router.match_event("test.triggered", None);
        let got: Vec<(&str, &str)> = matches
            .iter()
            .map(|m| (m.pipeline_name, m.step.id.as_str()))
            .collect();
        assert_eq!(got, [("e2e-chain", "processor"), ("audit", "log-it")]);
    }

    #[test]
    fn inline_chaining_advances_to_the_next_step() {
        let router = router();
        let ctx = context("e2e-chain", "processor");
        let matches = router.match_event("video.processed", Some(&ctx));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].step.id, "notifier");
    }

    #[test]
    fn when_predicate_filters_chaining() {
        let router = router();
        let ctx = context("e2e-chain", "processor");
        assert!(router.match_event("video.failed", Some(&ctx)).is_empty());
    }

    #[test]
    fn last_step_has_nothing_to_chain_to() {
        let router = router();
        let ctx = context("e2e-chain", "notifier");
        assert!(router.match_event("video.processed", Some(&ctx)).is_empty());
    }

    #[test]
    fn context_updates_merge_annotations_over_payload() {
        let router = router();
        let ctx = context("e2e-chain", "processor");
        let matches = router.match_event("video.processed", Some(&ctx));
        let payload = json!({"origin_user": "matt", "notified_via": "event"})
            .as_object()
            .cloned()
            .unwrap();
        let updates = matches[0].context_updates(&payload);
        assert_eq!(updates.get("origin_user"), Some(&json!("matt")));
        assert_eq!(updates.get("notified_via"), Some(&json!("pipeline")));
    }

    #[test]
    fn step_lookup_exposes_clone_flag() {
        let router = router();
        assert!(router.step("e2e-chain", "processor").unwrap().clone);
        assert!(!router.step("e2e-chain", "notifier").unwrap().clone);
        assert!(router.step("e2e-chain", "ghost").is_none());
    }

    #[test]
    fn validation_rejects_duplicates_and_empties() {
        let dup = vec![
            Pipeline {
                name: "p".into(),
                on: "a".into(),
                steps: vec![Step {
                    id: "s".into(),
                    uses: "x".into(),
                    with: Map::new(),
                    when: None,
                    clone: false,
                    annotations: Map::new(),
                }],
            },
            Pipeline {
                name: "p".into(),
                on: "b".into(),
                steps: vec![Step {
                    id: "s".into(),
                    uses: "x".into(),
                    with: Map::new(),
                    when: None,
                    clone: false,
                    annotations: Map::new(),
                }],
            },
        ];
        assert!(matches!(
            Router::new(dup),
            Err(RouterError::DuplicatePipeline(_))
        ));

        let empty = vec![Pipeline {
            name: "p".into(),
            on: "a".into(),
            steps: Vec::new(),
        }];
        assert!(matches!(Router::new(empty), Err(RouterError::EmptyPipeline(_))));
    }

    #[test]
    fn load_from_directory_in_sorted_file_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("b.yaml"),
            "pipelines:\n  - name: second\n    on: go\n    steps:\n      - {id: s, uses: p}\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.yaml"),
            "pipelines:\n  - name: first\n    on: go\n    steps:\n      - {id: s, uses: p}\n",
        )
        .unwrap();

        let router = Router::load(dir.path()).unwrap();
        let matches = router.match_event("go", None);
        let names: Vec<&str> = matches.iter().map(|m| m.pipeline_name).collect();
        assert_eq!(names, ["first", "second"]);
    }
}
