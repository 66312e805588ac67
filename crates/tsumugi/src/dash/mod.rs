//! MPEG-DASH manifest parsing for static presentations.
//!
//! [`parse_mpd`] turns an MPD document into flat [`Representation`]s with
//! fully expanded segment lists. Only the first period is used.

pub mod template;
pub mod url;

use std::{borrow::Cow, time::Duration};

use ::url::Url;
use dash_mpd::{SegmentList, SegmentTemplate, MPD};

pub use self::url::merge_baseurls;
pub use template::Template;

use crate::{
    error::{TsumugiError, TsumugiResult},
    model::{EncryptionContext, InitSegment, Representation, SegmentRef, StreamKind},
    util::range::ByteRange,
};
use self::url::parse_media_range;

/// Segment count used when a template gives no way to derive it.
const FALLBACK_SEGMENT_COUNT: u64 = 100;

/// Parse an MPD document fetched from `mpd_url`.
pub fn parse_mpd(text: &str, mpd_url: &Url) -> TsumugiResult<Vec<Representation>> {
    let mpd = dash_mpd::parse(text)?;
    let pssh = find_pssh(&mpd);
    if let Some(pssh) = &pssh {
        tracing::debug!("Found PSSH: {pssh}");
    }

    let mut base_url = mpd_url.clone();
    if let Some(mpd_base_url) = mpd.base_url.first() {
        base_url = merge_baseurls(&base_url, &mpd_base_url.base)?;
    }

    let Some(period) = mpd.periods.first() else {
        return Err(TsumugiError::MpdParsing("MPD has no Period".to_string()));
    };
    if mpd.periods.len() > 1 {
        tracing::warn!(
            "MPD has {} periods, only the first one is downloaded.",
            mpd.periods.len()
        );
    }

    let base_url = match period.BaseURL.first() {
        Some(period_base_url) => merge_baseurls(&base_url, &period_base_url.base)?,
        None => base_url,
    };
    let period_duration = period.duration.or(mpd.mediaPresentationDuration);

    let mut representations = Vec::new();
    for adaptation in &period.adaptations {
        let base_url = match adaptation.BaseURL.first() {
            Some(adaptation_base_url) => {
                Cow::Owned(merge_baseurls(&base_url, &adaptation_base_url.base)?)
            }
            None => Cow::Borrowed(&base_url),
        };

        for (index, representation) in adaptation.representations.iter().enumerate() {
            let mime_type = representation
                .mimeType
                .as_deref()
                .or(adaptation.mimeType.as_deref())
                .or(adaptation.contentType.as_deref())
                .or(representation.contentType.as_deref());
            let Some(kind) = StreamKind::from_mime_type(mime_type) else {
                tracing::debug!("Skipping representation with mime type {mime_type:?}");
                continue;
            };

            let base_url = match representation.BaseURL.first() {
                Some(representation_base_url) => {
                    merge_baseurls(&base_url, &representation_base_url.base)?
                }
                None => base_url.clone().into_owned(),
            };

            let id = representation
                .id
                .clone()
                .unwrap_or_else(|| format!("{kind}-{index}"));
            let template = Template::new(representation.id.clone(), representation.bandwidth);

            let (init, segments) = if let Some(segment_template) = representation
                .SegmentTemplate
                .as_ref()
                .or(adaptation.SegmentTemplate.as_ref())
            {
                template_segments(segment_template, &template, &base_url, period_duration)?
            } else if let Some(segment_list) = representation
                .SegmentList
                .as_ref()
                .or(adaptation.SegmentList.as_ref())
            {
                list_segments(segment_list, &base_url)?
            } else {
                // SegmentBase or a bare BaseURL: the whole resource is one segment
                let segment = SegmentRef {
                    index: 0,
                    sequence: 0,
                    url: base_url.clone(),
                    byte_range: None,
                    duration: period_duration.map(|d| d.as_secs_f64()),
                };
                (None, vec![segment])
            };

            let protected = !adaptation.ContentProtection.is_empty()
                || !representation.ContentProtection.is_empty();
            let encryption = if protected {
                EncryptionContext::Cenc {
                    pssh: pssh.clone().unwrap_or_default(),
                    license_url: None,
                }
            } else {
                EncryptionContext::None
            };

            representations.push(Representation {
                id,
                kind,
                codec: representation
                    .codecs
                    .clone()
                    .or_else(|| adaptation.codecs.clone()),
                bandwidth: representation.bandwidth.unwrap_or_default(),
                width: representation.width,
                height: representation.height,
                language: representation.lang.clone().or_else(|| adaptation.lang.clone()),
                init,
                segments,
                encryption,
                duration: period_duration,
            });
        }
    }

    if representations.is_empty() {
        return Err(TsumugiError::NoRepresentationFound);
    }
    tracing::debug!("Parsed {} representation(s) from MPD", representations.len());
    Ok(representations)
}

/// The first PSSH found anywhere in the document. Later ones, which usually
/// belong to other DRM systems, are ignored.
fn find_pssh(mpd: &MPD) -> Option<String> {
    let pssh_of = |protections: &[dash_mpd::ContentProtection]| {
        protections.iter().find_map(|protection| {
            protection
                .cenc_pssh
                .iter()
                .find_map(|pssh| pssh.content.as_deref())
                .map(|content| content.trim().to_string())
                .filter(|content| !content.is_empty())
        })
    };

    mpd.periods.iter().find_map(|period| {
        period.adaptations.iter().find_map(|adaptation| {
            pssh_of(&adaptation.ContentProtection).or_else(|| {
                adaptation
                    .representations
                    .iter()
                    .find_map(|representation| pssh_of(&representation.ContentProtection))
            })
        })
    })
}

/// One expanded segment: `$Number$`, `$Time$` and duration in timescale units.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TimedSegment {
    number: u64,
    time: u64,
    duration: u64,
}

/// Expand a `SegmentTimeline`. `end_time` is where a negative `S@r` stops
/// when no later `S@t` exists.
fn expand_timeline(
    timeline: &[dash_mpd::S],
    start_number: u64,
    end_time: Option<u64>,
) -> Vec<TimedSegment> {
    let mut segments = Vec::new();
    let mut number = start_number;
    let mut time = 0;

    for (position, s) in timeline.iter().enumerate() {
        if let Some(t) = s.t {
            time = t;
        }
        if s.d == 0 {
            tracing::warn!("Ignoring S element with zero duration.");
            continue;
        }

        let repeat = match s.r {
            Some(r) if r < 0 => {
                let limit = timeline
                    .get(position + 1)
                    .and_then(|next| next.t)
                    .or(end_time);
                match limit {
                    Some(limit) => limit.saturating_sub(time).div_ceil(s.d).saturating_sub(1),
                    None => {
                        tracing::warn!("S@r=-1 without an end, repeating once.");
                        0
                    }
                }
            }
            Some(r) => r as u64,
            None => 0,
        };

        for _ in 0..=repeat {
            segments.push(TimedSegment {
                number,
                time,
                duration: s.d,
            });
            number += 1;
            time += s.d;
        }
    }

    segments
}

fn template_segments(
    segment_template: &SegmentTemplate,
    template: &Template,
    base_url: &Url,
    period_duration: Option<Duration>,
) -> TsumugiResult<(Option<InitSegment>, Vec<SegmentRef>)> {
    let init = segment_template
        .initialization
        .as_deref()
        .map(|initialization| -> TsumugiResult<InitSegment> {
            Ok(InitSegment {
                url: merge_baseurls(base_url, &template.resolve(initialization))?,
                byte_range: None,
            })
        })
        .transpose()?;

    let media = segment_template.media.as_deref().ok_or_else(|| {
        TsumugiError::MpdParsing("Missing media url template in representation".to_string())
    })?;
    let start_number = segment_template.startNumber.unwrap_or(1);
    let timescale = segment_template.timescale.unwrap_or(1).max(1);

    let timed = match &segment_template.SegmentTimeline {
        Some(timeline) => {
            let first_time = timeline
                .segments
                .first()
                .and_then(|s| s.t)
                .unwrap_or_default();
            let end_time = period_duration
                .map(|d| first_time + (d.as_secs_f64() * timescale as f64).ceil() as u64);
            expand_timeline(&timeline.segments, start_number, end_time)
        }
        None => {
            let duration = segment_template
                .duration
                .map(|d| d as f64)
                .filter(|d| *d > 0.0);
            let count = match (duration, period_duration) {
                (Some(duration), Some(period_duration)) => {
                    (period_duration.as_secs_f64() * timescale as f64 / duration).ceil() as u64
                }
                _ => {
                    tracing::warn!(
                        "Cannot derive segment count from the template, guessing {FALLBACK_SEGMENT_COUNT} segments."
                    );
                    FALLBACK_SEGMENT_COUNT
                }
            };
            let duration = duration.unwrap_or_default() as u64;
            (0..count)
                .map(|i| TimedSegment {
                    number: start_number + i,
                    time: i * duration,
                    duration,
                })
                .collect()
        }
    };

    let mut segments = Vec::with_capacity(timed.len());
    for (index, segment) in timed.into_iter().enumerate() {
        let path = template
            .at(segment.number, Some(segment.time))
            .resolve(media);
        segments.push(SegmentRef {
            index,
            sequence: segment.number,
            url: merge_baseurls(base_url, &path)?,
            byte_range: None,
            duration: (segment.duration > 0)
                .then(|| segment.duration as f64 / timescale as f64),
        });
    }

    Ok((init, segments))
}

fn list_segments(
    segment_list: &SegmentList,
    base_url: &Url,
) -> TsumugiResult<(Option<InitSegment>, Vec<SegmentRef>)> {
    let init = match &segment_list.Initialization {
        Some(initialization) => Some(InitSegment {
            url: match &initialization.sourceURL {
                Some(source_url) => merge_baseurls(base_url, source_url)?,
                None => base_url.clone(),
            },
            byte_range: initialization
                .range
                .as_deref()
                .map(parse_media_range)
                .transpose()?,
        }),
        None => None,
    };

    let mut segments = Vec::with_capacity(segment_list.segment_urls.len());
    for (index, segment_url) in segment_list.segment_urls.iter().enumerate() {
        let url = match &segment_url.media {
            Some(media) => merge_baseurls(base_url, media)?,
            None => base_url.clone(),
        };
        let byte_range: Option<ByteRange> = segment_url
            .mediaRange
            .as_deref()
            .map(parse_media_range)
            .transpose()?;

        segments.push(SegmentRef {
            index,
            sequence: index as u64,
            url,
            byte_range,
            duration: None,
        });
    }

    Ok((init, segments))
}
