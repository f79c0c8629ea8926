use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use reqwest::header::ACCEPT;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::{self, ResponseMode};
use crate::error::{CompareError, Result};
use crate::profile::ModelProfile;
use crate::session::HttpSession;
use crate::stream::{self, StreamEvent};

/// Distinguishes the two prompt variants a compare round can run per model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptVariant {
    Augmented,
    Raw,
}

/// One schedulable pipeline: a captured profile plus the prompt it receives.
///
/// The profile is cloned in, so edits to the registry after submission never
/// reach a pipeline already in flight.
#[derive(Debug, Clone)]
pub struct CompareUnit {
    pub profile: ModelProfile,
    pub prompt: String,
    pub used_augmentation: bool,
    pub variant: Option<PromptVariant>,
}

impl CompareUnit {
    /// Map key for this unit's record and cancellation token.
    pub fn key(&self) -> String {
        match self.variant {
            None => self.profile.id.clone(),
            Some(PromptVariant::Augmented) => format!("{}-rag", self.profile.id),
            Some(PromptVariant::Raw) => format!("{}-norag", self.profile.id),
        }
    }
}

/// Accumulated state of one unit's response.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub model_id: String,
    /// Captured at dispatch from the profile's display name.
    pub model_name: String,
    pub text: String,
    pub is_complete: bool,
    pub error: Option<String>,
    pub used_augmentation: bool,
    pub variant: Option<PromptVariant>,
}

impl ResponseRecord {
    fn new(unit: &CompareUnit) -> Self {
        Self {
            model_id: unit.profile.id.clone(),
            model_name: unit.profile.display_name().to_owned(),
            text: String::new(),
            is_complete: false,
            error: None,
            used_augmentation: unit.used_augmentation,
            variant: unit.variant,
        }
    }
}

pub type ResponseMap = BTreeMap<String, ResponseRecord>;

/// What the consumer loop hears from one pipeline.
#[derive(Debug, Clone)]
pub enum UnitEvent {
    Stream(StreamEvent),
    /// The pipeline stopped because its token fired; terminal, not an error.
    Aborted,
}

#[derive(Debug, Clone)]
pub struct UnitUpdate {
    pub key: String,
    pub event: UnitEvent,
}

/// Keyed cancellation registry shared between a round and its caller.
#[derive(Debug, Default, Clone)]
pub struct StopSwitch {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl StopSwitch {
    fn register(&self, key: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock().insert(key.to_owned(), token.clone());
        token
    }

    fn finish(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Cancel every active pipeline and clear the set. Idempotent: repeated
    /// calls, including after the round has drained, are no-ops.
    pub fn stop_all(&self) {
        let mut tokens = self.lock();
        if !tokens.is_empty() {
            tracing::info!(active = tokens.len(), "stopping all pipelines");
        }
        for token in tokens.values() {
            token.cancel();
        }
        tokens.clear();
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.tokens
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Expand selected profiles into the units of one round.
///
/// Augmentation happens once per submission; this only decides which prompt
/// string each unit carries and how its record is keyed.
pub fn build_units(
    profiles: Vec<ModelProfile>,
    prompt: &str,
    augmented: Option<&str>,
    compare_variants: bool,
) -> Vec<CompareUnit> {
    let mut units = Vec::new();
    for profile in profiles {
        match augmented {
            Some(augmented_prompt) if compare_variants => {
                units.push(CompareUnit {
                    profile: profile.clone(),
                    prompt: augmented_prompt.to_owned(),
                    used_augmentation: true,
                    variant: Some(PromptVariant::Augmented),
                });
                units.push(CompareUnit {
                    profile,
                    prompt: prompt.to_owned(),
                    used_augmentation: false,
                    variant: Some(PromptVariant::Raw),
                });
            }
            Some(augmented_prompt) => units.push(CompareUnit {
                profile,
                prompt: augmented_prompt.to_owned(),
                used_augmentation: true,
                variant: None,
            }),
            None => units.push(CompareUnit {
                profile,
                prompt: prompt.to_owned(),
                used_augmentation: false,
                variant: None,
            }),
        }
    }
    units
}

/// Fan one submission out to every unit and collect the finished records.
///
/// Each unit runs as its own task and reports through a channel; this loop
/// is the only writer to the record map, so interleaved pipelines can never
/// corrupt each other's text. Returns once every unit has reached a
/// terminal state.
pub async fn run_compare(
    session: &HttpSession,
    units: Vec<CompareUnit>,
    stop: StopSwitch,
    mut tap: Option<mpsc::Sender<UnitUpdate>>,
) -> Result<ResponseMap> {
    if units.is_empty() {
        return Err(CompareError::Configuration(
            "at least one model must be selected".into(),
        ));
    }

    let run_id = Uuid::new_v4();
    tracing::info!(%run_id, units = units.len(), "starting comparison round");

    let mut records = ResponseMap::new();
    for unit in &units {
        let key = unit.key();
        if records.insert(key.clone(), ResponseRecord::new(unit)).is_some() {
            return Err(CompareError::Configuration(format!(
                "duplicate unit key `{key}`; model ids must be unique"
            )));
        }
    }

    let (updates_tx, mut updates_rx) = mpsc::channel::<UnitUpdate>(256);
    for unit in units {
        let key = unit.key();
        let cancel = stop.register(&key);
        tokio::spawn(run_unit(session.clone(), unit, cancel, updates_tx.clone()));
    }
    drop(updates_tx);

    while let Some(update) = updates_rx.recv().await {
        if let Some(sender) = tap.as_ref() {
            if sender.send(update.clone()).await.is_err() {
                tap = None;
            }
        }
        apply_update(&mut records, &stop, update);
    }

    for record in records.values_mut() {
        record.is_complete = true;
    }

    tracing::info!(%run_id, "comparison round finished");
    Ok(records)
}

fn apply_update(records: &mut ResponseMap, stop: &StopSwitch, update: UnitUpdate) {
    let Some(record) = records.get_mut(&update.key) else {
        return;
    };
    match update.event {
        UnitEvent::Stream(StreamEvent::TextDelta(delta)) => record.text.push_str(&delta),
        UnitEvent::Stream(StreamEvent::Completed) => {
            record.is_complete = true;
            stop.finish(&update.key);
        }
        UnitEvent::Stream(StreamEvent::Failed(err)) => {
            tracing::error!(unit = %update.key, "pipeline failed: {err}");
            record.is_complete = true;
            record.error = Some(err.to_string());
            stop.finish(&update.key);
        }
        UnitEvent::Aborted => {
            record.is_complete = true;
            stop.finish(&update.key);
        }
    }
}

/// Run one pipeline to its terminal state.
///
/// The normalizer goes quiet when the token fires, so an explicit `Aborted`
/// is reported afterwards to let the consumer close the record out.
async fn run_unit(
    session: HttpSession,
    unit: CompareUnit,
    cancel: CancellationToken,
    updates: mpsc::Sender<UnitUpdate>,
) {
    let key = unit.key();
    let (events_tx, mut events_rx) = mpsc::channel::<StreamEvent>(64);

    let forward = async {
        while let Some(event) = events_rx.recv().await {
            let update = UnitUpdate {
                key: key.clone(),
                event: UnitEvent::Stream(event),
            };
            if updates.send(update).await.is_err() {
                break;
            }
        }
    };

    tokio::join!(
        drive_pipeline(&session, &unit, &cancel, events_tx),
        forward
    );

    if cancel.is_cancelled() {
        let _ = updates
            .send(UnitUpdate {
                key,
                event: UnitEvent::Aborted,
            })
            .await;
    }
}

async fn drive_pipeline(
    session: &HttpSession,
    unit: &CompareUnit,
    cancel: &CancellationToken,
    events: mpsc::Sender<StreamEvent>,
) {
    let plan = match adapter::build_plan(session.relay_base(), &unit.profile, &unit.prompt) {
        Ok(plan) => plan,
        Err(err) => {
            let _ = events.send(StreamEvent::Failed(err)).await;
            return;
        }
    };

    tracing::debug!(
        model = %unit.profile.id,
        dialect = plan.dialect.label(),
        url = %plan.url,
        "dispatching model request"
    );

    let mut request = session.client().post(plan.url.clone()).json(&plan.body);
    for (name, value) in &plan.headers {
        request = request.header(*name, value.as_str());
    }
    if plan.mode == ResponseMode::EventStream {
        request = request.header(ACCEPT, "text/event-stream");
    }

    let response = tokio::select! {
        biased;
        _ = cancel.cancelled() => return,
        result = request.send() => match result {
            Ok(response) => response,
            Err(err) => {
                let _ = events.send(StreamEvent::Failed(err.into())).await;
                return;
            }
        },
    };

    let status = response.status();
    if !status.is_success() {
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            body = response.text() => body.unwrap_or_default(),
        };
        let snippet: String = body.chars().take(500).collect();
        let failure = CompareError::Transport(format!("http {status}: {snippet}"));
        let _ = events.send(StreamEvent::Failed(failure)).await;
        return;
    }

    match plan.mode {
        ResponseMode::SingleJson => {
            let body = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                body = response.bytes() => body,
            };
            match body {
                Ok(body) => stream::normalize_single_json(&body, &events).await,
                Err(err) => {
                    let _ = events.send(StreamEvent::Failed(err.into())).await;
                }
            }
        }
        ResponseMode::EventStream => {
            stream::normalize_event_stream(response.bytes_stream(), cancel, &events).await;
        }
    }
}
