//! `SegmentTemplate` identifier substitution.
//!
//! Only `%0[width]d` format tags are permitted by DASH-IF IOP, so they are
//! implemented directly instead of through a printf crate.
//!
//! Example template: `$RepresentationID$/$Number%06d$.m4s`

use std::sync::LazyLock;

use regex::{Captures, Regex, Replacer};

static TEMPLATE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$(?:(RepresentationID|Number|Time|Bandwidth)(?:%0(\d+)d)?)?\$")
        .unwrap_or_else(|e| unreachable!("invalid template regex: {e}"))
});

/// Values substituted into a segment template for one representation.
#[derive(Debug, Clone, Default)]
pub struct Template {
    representation_id: Option<String>,
    bandwidth: Option<u64>,
    number: Option<u64>,
    time: Option<u64>,
}

impl Template {
    pub fn new(representation_id: Option<String>, bandwidth: Option<u64>) -> Self {
        Self {
            representation_id,
            bandwidth,
            ..Default::default()
        }
    }

    /// Same representation, at segment `number` starting at `time`.
    pub fn at(&self, number: u64, time: Option<u64>) -> Self {
        Self {
            number: Some(number),
            time,
            ..self.clone()
        }
    }

    fn value(&self, identifier: &str) -> Option<String> {
        match identifier {
            "RepresentationID" => self.representation_id.clone(),
            "Number" => self.number.map(|n| n.to_string()),
            "Time" => self.time.map(|t| t.to_string()),
            "Bandwidth" => self.bandwidth.map(|b| b.to_string()),
            _ => None,
        }
    }

    /// Replace every known identifier in `template`. `$$` becomes `$`, and
    /// identifiers without a value are left untouched.
    pub fn resolve(&self, template: &str) -> String {
        TEMPLATE_REGEX
            .replace_all(template, TemplateReplacer(self))
            .into_owned()
    }
}

struct TemplateReplacer<'a>(&'a Template);

impl Replacer for TemplateReplacer<'_> {
    fn replace_append(&mut self, caps: &Captures<'_>, dst: &mut String) {
        let Some(identifier) = caps.get(1) else {
            dst.push('$');
            return;
        };
        let Some(value) = self.0.value(identifier.as_str()) else {
            dst.push_str(&caps[0]);
            return;
        };

        match caps.get(2).and_then(|w| w.as_str().parse::<usize>().ok()) {
            Some(width) => dst.push_str(&format!("{value:0>width$}")),
            None => dst.push_str(&value),
        }
    }
}
