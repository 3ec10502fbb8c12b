//! Point filtering by attribute channel value.
//!
//! A filter that names a channel the cloud does not carry is a no-op. Filters
//! are often defined for a whole run (e.g. "ground points only") while some
//! inputs never loaded the channel; such inputs pass through unchanged.

use std::fmt;

use log::debug;

use crate::core::cloud::{AttributeValues, CloudError, PointCloudData};

/// LAS classification code for ground points.
pub const GROUND_CLASS: f64 = 2.0;

/// Reduce `cloud` to the points selected by `predicate` on one channel.
///
/// # Arguments
///
/// * `cloud` - Cloud to filter (consumed)
/// * `channel` - Attribute channel the predicate reads
/// * `predicate` - Maps the channel's values to a keep-mask
///
/// # Returns
///
/// The reduced cloud, or the unchanged cloud when `channel` is absent.
///
/// # Errors
///
/// Returns [`CloudError::ShapeMismatch`] if the predicate returns a mask whose
/// length differs from the point count.
pub fn filter<F>(cloud: PointCloudData, channel: &str, predicate: F) -> Result<PointCloudData, CloudError>
where
    F: FnOnce(&AttributeValues) -> Vec<bool>,
{
    let mask = match cloud.attribute(channel) {
        Some(values) => predicate(values),
        None => {
            debug!("Channel '{}' not present, filter skipped", channel);
            return Ok(cloud);
        }
    };

    let before = cloud.len();
    let reduced = cloud.reduce(&mask)?;
    debug!(
        "Filter on '{}' kept {} of {} points",
        channel,
        reduced.len(),
        before
    );

    Ok(reduced)
}

type Predicate = Box<dyn Fn(&AttributeValues) -> Vec<bool> + Send + Sync>;

/// A named, reusable filter applied to every loaded input.
pub struct AttributeFilter {
    channel: String,
    description: String,
    predicate: Predicate,
}

impl AttributeFilter {
    /// Creates a filter from an arbitrary mask-producing predicate.
    pub fn new<F>(channel: impl Into<String>, description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&AttributeValues) -> Vec<bool> + Send + Sync + 'static,
    {
        Self {
            channel: channel.into(),
            description: description.into(),
            predicate: Box::new(predicate),
        }
    }

    /// Keeps points whose channel value equals `value`.
    pub fn equals(channel: impl Into<String>, value: f64) -> Self {
        let channel = channel.into();
        let description = format!("{} == {}", channel, value);
        Self::new(channel, description, move |values| {
            values.mask_where(|v| v == value)
        })
    }

    /// Keeps ground points only (`classification == 2`).
    pub fn ground_points() -> Self {
        Self::equals("classification", GROUND_CLASS)
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Applies the filter; see [`filter`].
    pub fn apply(&self, cloud: PointCloudData) -> Result<PointCloudData, CloudError> {
        filter(cloud, &self.channel, |values| (self.predicate)(values))
    }
}

impl fmt::Debug for AttributeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttributeFilter")
            .field("channel", &self.channel)
            .field("description", &self.description)
            .finish()
    }
}

impl fmt::Display for AttributeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.description)
    }
}
