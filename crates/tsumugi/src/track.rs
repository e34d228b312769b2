use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::watch;

use crate::{
    manifest::{Adaptation, Period, TrackType},
    TsumugiError, TsumugiResult,
};

/// How the adaptation of a track type is chosen in new periods.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TrackPreference {
    /// No track of this type.
    Disabled,
    /// First playable audio and video adaptation, nothing for text and images.
    #[default]
    Default,
    /// First playable adaptation in this language, falling back to the default.
    Language(String),
}

pub type AdaptationChoice = watch::Receiver<Option<Arc<Adaptation>>>;

struct Choice {
    period: Arc<Period>,
    sender: watch::Sender<Option<Arc<Adaptation>>>,
}

#[derive(Default)]
struct SelectorState {
    preferences: HashMap<TrackType, TrackPreference>,
    choices: HashMap<(String, TrackType), Choice>,
}

/// Adaptation chosen for every (period, track type).
#[derive(Clone, Default)]
pub struct TrackSelector {
    inner: Arc<Mutex<SelectorState>>,
}

fn resolve(
    period: &Period,
    track_type: TrackType,
    preference: &TrackPreference,
) -> Option<Arc<Adaptation>> {
    let mut playable = period
        .adaptations_for(track_type)
        .iter()
        .filter(|a| a.is_playable());
    let default = || {
        if track_type.is_essential() {
            period
                .adaptations_for(track_type)
                .iter()
                .find(|a| a.is_playable())
                .cloned()
        } else {
            None
        }
    };

    match preference {
        TrackPreference::Disabled => None,
        TrackPreference::Default => default(),
        TrackPreference::Language(language) => playable
            .find(|a| a.language.as_deref() == Some(language.as_str()))
            .cloned()
            .or_else(default),
    }
}

fn same_choice(a: &Option<Arc<Adaptation>>, b: &Option<Arc<Adaptation>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.id == b.id,
        (None, None) => true,
        _ => false,
    }
}

impl TrackSelector {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SelectorState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Choice of `track_type` in `period`, resolved from the preference on first use.
    pub fn subscribe(&self, period: &Arc<Period>, track_type: TrackType) -> AdaptationChoice {
        let mut state = self.state();
        let preference = state
            .preferences
            .get(&track_type)
            .cloned()
            .unwrap_or_default();
        state
            .choices
            .entry((period.id.clone(), track_type))
            .or_insert_with(|| Choice {
                period: period.clone(),
                sender: watch::Sender::new(resolve(period, track_type, &preference)),
            })
            .sender
            .subscribe()
    }

    /// Current choice, `None` when no track of this type is wanted or the period is unknown.
    pub fn current(&self, period_id: &str, track_type: TrackType) -> Option<Arc<Adaptation>> {
        self.state()
            .choices
            .get(&(period_id.to_string(), track_type))
            .and_then(|choice| choice.sender.borrow().clone())
    }

    /// Change the preference of `track_type`, re-resolving the choice of every known period.
    pub fn set_preference(&self, track_type: TrackType, preference: TrackPreference) {
        let mut state = self.state();
        for ((_, t), choice) in state.choices.iter() {
            if *t != track_type {
                continue;
            }
            let next = resolve(&choice.period, track_type, &preference);
            choice.sender.send_if_modified(|current| {
                if same_choice(current, &next) {
                    return false;
                }
                *current = next;
                true
            });
        }
        tracing::info!(%track_type, ?preference, "Track preference changed.");
        state.preferences.insert(track_type, preference);
    }

    /// Choose an adaptation of `period_id` explicitly, or none.
    pub fn select(
        &self,
        period_id: &str,
        track_type: TrackType,
        adaptation_id: Option<&str>,
    ) -> TsumugiResult<()> {
        let state = self.state();
        let choice = state
            .choices
            .get(&(period_id.to_string(), track_type))
            .ok_or_else(|| TsumugiError::UnsupportedTrack {
                track_type,
                reason: format!("period {period_id} is not being streamed"),
            })?;

        let next = match adaptation_id {
            Some(id) => {
                let adaptation = choice
                    .period
                    .find_adaptation(track_type, id)
                    .filter(|a| a.is_playable())
                    .ok_or_else(|| TsumugiError::UnsupportedTrack {
                        track_type,
                        reason: format!("no playable adaptation {id} in period {period_id}"),
                    })?;
                Some(adaptation.clone())
            }
            None => None,
        };

        choice.sender.send_if_modified(|current| {
            if same_choice(current, &next) {
                return false;
            }
            *current = next;
            true
        });
        Ok(())
    }

    /// Drop the choice of a period that is no longer streamed.
    pub fn forget(&self, period_id: &str, track_type: TrackType) {
        self.state()
            .choices
            .remove(&(period_id.to_string(), track_type));
    }
}
