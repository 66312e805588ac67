//! Representation selection.
//!
//! Every function here is pure: the same candidates and policy always pick
//! the same representation.

use std::{convert::Infallible, str::FromStr};

use serde::Deserialize;

use crate::{
    error::{TsumugiError, TsumugiResult},
    model::{Representation, StreamKind},
};

/// Anything a selector can rank.
pub trait Selectable {
    fn kind(&self) -> StreamKind;
    fn width(&self) -> Option<u64>;
    fn height(&self) -> Option<u64>;
    fn bandwidth(&self) -> u64;
    fn language(&self) -> Option<&str>;

    fn rank(&self) -> (u64, u64, u64) {
        (
            self.height().unwrap_or_default(),
            self.width().unwrap_or_default(),
            self.bandwidth(),
        )
    }
}

impl<T: Selectable + ?Sized> Selectable for &T {
    fn kind(&self) -> StreamKind {
        (**self).kind()
    }

    fn width(&self) -> Option<u64> {
        (**self).width()
    }

    fn height(&self) -> Option<u64> {
        (**self).height()
    }

    fn bandwidth(&self) -> u64 {
        (**self).bandwidth()
    }

    fn language(&self) -> Option<&str> {
        (**self).language()
    }
}

impl Selectable for Representation {
    fn kind(&self) -> StreamKind {
        self.kind
    }

    fn width(&self) -> Option<u64> {
        self.width
    }

    fn height(&self) -> Option<u64> {
        self.height
    }

    fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum ResolutionPolicy {
    #[default]
    Best,
    Worst,
    /// `1080p`, `1080` or `1920x1080`.
    Explicit(String),
}

impl ResolutionPolicy {
    /// `(width, height)` requested by an explicit policy.
    fn dimensions(&self) -> Option<(Option<u64>, u64)> {
        let Self::Explicit(value) = self else {
            return None;
        };

        let value = value.trim().to_ascii_lowercase();
        if let Some((width, height)) = value.split_once('x') {
            let width = width.trim().parse().ok()?;
            let height = height.trim().parse().ok()?;
            return Some((Some(width), height));
        }

        let height = value.strip_suffix('p').unwrap_or(&value).parse().ok()?;
        Some((None, height))
    }
}

impl FromStr for ResolutionPolicy {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "" | "best" => Self::Best,
            "worst" => Self::Worst,
            _ => Self::Explicit(s.trim().to_string()),
        })
    }
}

impl From<String> for ResolutionPolicy {
    fn from(value: String) -> Self {
        match value.parse() {
            Ok(policy) => policy,
            Err(e) => match e {},
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct SelectionPolicy {
    pub resolution: ResolutionPolicy,
    /// Preferred audio languages, most preferred first.
    pub languages: Vec<String>,
}

/// The streams chosen for one download.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub video: Representation,
    pub audio: Option<Representation>,
}

pub fn select_video<'a, T: Selectable>(
    candidates: &'a [T],
    policy: &ResolutionPolicy,
) -> Option<&'a T> {
    let videos = candidates.iter().filter(|c| c.kind() == StreamKind::Video);

    match policy {
        ResolutionPolicy::Best => videos.max_by_key(|c| c.rank()),
        ResolutionPolicy::Worst => videos.min_by_key(|c| c.rank()),
        ResolutionPolicy::Explicit(value) => {
            let Some((width, height)) = policy.dimensions() else {
                tracing::warn!("Invalid resolution {value:?}, selecting the best one instead.");
                return select_video(candidates, &ResolutionPolicy::Best);
            };

            let matched = videos
                .filter(|c| c.height() == Some(height) && width.map_or(true, |w| c.width() == Some(w)))
                .max_by_key(|c| c.rank());
            if matched.is_none() {
                tracing::warn!("No representation matches {value}, selecting the best one instead.");
                return select_video(candidates, &ResolutionPolicy::Best);
            }
            matched
        }
    }
}

/// First candidate whose language matches a preference, trying preferences
/// in order. Falls back to the highest bandwidth.
pub fn select_audio<'a, T: Selectable>(candidates: &'a [T], languages: &[String]) -> Option<&'a T> {
    let audios: Vec<&T> = candidates
        .iter()
        .filter(|c| c.kind() == StreamKind::Audio)
        .collect();

    for preferred in languages {
        let found = audios.iter().find(|c| {
            c.language()
                .is_some_and(|language| language_matches(language, preferred))
        });
        if let Some(found) = found {
            return Some(*found);
        }
    }

    audios.into_iter().max_by_key(|c| c.bandwidth())
}

/// Case-insensitive match. A bare primary tag also matches its regional
/// variants, so `en` matches `en-US`.
fn language_matches(language: &str, preferred: &str) -> bool {
    if language.eq_ignore_ascii_case(preferred) {
        return true;
    }
    !preferred.contains('-')
        && language
            .split(['-', '_'])
            .next()
            .is_some_and(|primary| primary.eq_ignore_ascii_case(preferred))
}

/// Pick one video and at most one audio representation.
pub fn select(
    representations: &[Representation],
    policy: &SelectionPolicy,
) -> TsumugiResult<Selection> {
    let video = select_video(representations, &policy.resolution)
        .ok_or(TsumugiError::NoRepresentationFound)?;
    let audio = select_audio(representations, &policy.languages);

    tracing::info!("Selected video: {video}");
    if let Some(audio) = audio {
        tracing::info!("Selected audio: {audio}");
    }

    Ok(Selection {
        video: video.clone(),
        audio: audio.cloned(),
    })
}
