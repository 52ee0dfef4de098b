// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Duration histogram that only pays for an HDR histogram once it is needed.
//!
//! Most aggregates only ever see a handful of transactions, so values are
//! kept raw until [`RAW_VALUE_LIMIT`] is reached and only then converted into
//! an [`hdrhistogram::Histogram`]. Values are nanoseconds, but the HDR
//! histogram discerns no finer than one microsecond to keep the bucket count
//! (and memory) down.

use hdrhistogram::serialization::{Deserializer, Serializer, V2Serializer};
use hdrhistogram::{CreationError, Histogram};
use serde::Serialize;
use tracing::error;

const RAW_VALUE_LIMIT: usize = 1024;
const LOWEST_DISCERNIBLE_NANOS: u64 = 1_000;
const SIGNIFICANT_DIGITS: u8 = 2;

/// Wire form: either the sorted raw values or an encoded HDR histogram.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateHistogram {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ordered_raw_values: Vec<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub encoded_bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct LazyHistogram {
    raw_values: Vec<u64>,
    histogram: Option<Histogram<u64>>,
}

fn new_hdr_histogram() -> Result<Histogram<u64>, CreationError> {
    let mut histogram = Histogram::new_with_bounds(
        LOWEST_DISCERNIBLE_NANOS,
        LOWEST_DISCERNIBLE_NANOS * 2,
        SIGNIFICANT_DIGITS,
    )?;
    histogram.auto(true);
    Ok(histogram)
}

impl LazyHistogram {
    pub fn add(&mut self, nanos: u64) {
        if let Some(histogram) = self.histogram.as_mut() {
            record(histogram, nanos);
            return;
        }
        self.raw_values.push(nanos);
        if self.raw_values.len() > RAW_VALUE_LIMIT {
            self.convert_to_histogram();
        }
    }

    fn convert_to_histogram(&mut self) {
        match new_hdr_histogram() {
            Ok(mut histogram) => {
                for value in self.raw_values.drain(..) {
                    record(&mut histogram, value);
                }
                self.raw_values.shrink_to_fit();
                self.histogram = Some(histogram);
            }
            // values stay raw, which is still correct, just larger
            Err(e) => error!("Failed to create duration histogram: {e:?}"),
        }
    }

    #[must_use]
    pub fn count(&self) -> u64 {
        match &self.histogram {
            Some(histogram) => histogram.len(),
            None => self.raw_values.len() as u64,
        }
    }

    /// Value at `percentile` (0.0 ..= 100.0), `None` when empty.
    #[must_use]
    pub fn value_at_percentile(&self, percentile: f64) -> Option<u64> {
        if let Some(histogram) = &self.histogram {
            return Some(histogram.value_at_quantile(percentile / 100.0));
        }
        if self.raw_values.is_empty() {
            return None;
        }
        let mut sorted = self.raw_values.clone();
        sorted.sort_unstable();
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
        Some(sorted[rank.clamp(1, sorted.len()) - 1])
    }

    pub fn merge(&mut self, other: &LazyHistogram) {
        match &other.histogram {
            Some(other_histogram) => {
                if self.histogram.is_none() {
                    self.convert_to_histogram();
                }
                match self.histogram.as_mut() {
                    Some(histogram) => {
                        if let Err(e) = histogram.add(other_histogram) {
                            error!("Failed to merge duration histograms: {e:?}");
                        }
                    }
                    None => {
                        for value in other_histogram.iter_recorded() {
                            for _ in 0..value.count_at_value() {
                                self.add(value.value_iterated_to());
                            }
                        }
                    }
                }
            }
            None => {
                for value in &other.raw_values {
                    self.add(*value);
                }
            }
        }
    }

    /// Merges a built histogram, e.g. one read back from a flushed aggregate.
    pub fn merge_built(&mut self, built: &AggregateHistogram) {
        for value in &built.ordered_raw_values {
            self.add(*value);
        }
        if built.encoded_bytes.is_empty() {
            return;
        }
        let decoded: Result<Histogram<u64>, _> =
            Deserializer::new().deserialize(&mut built.encoded_bytes.as_slice());
        match decoded {
            Ok(histogram) => self.merge(&LazyHistogram {
                raw_values: Vec::new(),
                histogram: Some(histogram),
            }),
            Err(e) => error!("Failed to decode duration histogram: {e:?}"),
        }
    }

    #[must_use]
    pub fn build(&self) -> AggregateHistogram {
        match &self.histogram {
            Some(histogram) => {
                let mut encoded_bytes = Vec::new();
                if let Err(e) = V2Serializer::new().serialize(histogram, &mut encoded_bytes) {
                    error!("Failed to encode duration histogram: {e:?}");
                    encoded_bytes.clear();
                }
                AggregateHistogram {
                    ordered_raw_values: Vec::new(),
                    encoded_bytes,
                }
            }
            None => {
                let mut ordered_raw_values = self.raw_values.clone();
                ordered_raw_values.sort_unstable();
                AggregateHistogram {
                    ordered_raw_values,
                    encoded_bytes: Vec::new(),
                }
            }
        }
    }
}

fn record(histogram: &mut Histogram<u64>, nanos: u64) {
    if let Err(e) = histogram.record(nanos) {
        error!("Failed to record {nanos}ns in duration histogram: {e:?}");
    }
}
