//! Build and upload measurements published through the `metrics` facade.
//!
//! Names follow Prometheus conventions: `_seconds` for durations, `_bytes`
//! for sizes, `_total` for counters. Values go nowhere until the embedding
//! process installs a recorder. Each measurement is also logged at debug
//! level under the same name.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;

use crate::model::now;

pub const BUILD_DURATION: &str = "image_builder_build_duration_seconds";
pub const BUILD_RETURN_CODE: &str = "image_builder_build_return_code";
pub const BUILD_LAST: &str = "image_builder_build_last_timestamp_seconds";
pub const IMAGE_SIZE: &str = "image_builder_image_size_bytes";
pub const UPLOAD_DURATION: &str = "image_builder_upload_duration_seconds";
pub const UPLOADS: &str = "image_builder_uploads_total";

/// Attach descriptions to every metric this crate emits.
pub fn register() {
    describe_histogram!(BUILD_DURATION, "Wall time of the image build tool (by image)");
    describe_gauge!(BUILD_RETURN_CODE, "Exit code of the last build tool run (by image)");
    describe_gauge!(BUILD_LAST, "Unix time the last build finished (by image)");
    describe_gauge!(IMAGE_SIZE, "Allocated size of the last built image file (by image, format)");
    describe_histogram!(UPLOAD_DURATION, "Time to upload an image to a provider (by image, provider)");
    describe_counter!(UPLOADS, "Successful uploads (by image, provider)");
}

pub fn record_build(image: &str, elapsed: Duration, return_code: i32) {
    let finished = now();
    histogram!(BUILD_DURATION, "image" => image.to_string()).record(elapsed.as_secs_f64());
    gauge!(BUILD_RETURN_CODE, "image" => image.to_string()).set(f64::from(return_code));
    gauge!(BUILD_LAST, "image" => image.to_string()).set(finished);
    tracing::debug!(image, duration_secs = elapsed.as_secs_f64(), return_code,
        last_build = finished, "build measured");
}

/// Record the allocated size of a built file. Sparse images count only the
/// blocks they occupy.
pub fn record_image_size(image: &str, format: &str, path: &Path) -> std::io::Result<u64> {
    let size = std::fs::metadata(path)?.blocks() * 512;
    gauge!(IMAGE_SIZE, "image" => image.to_string(), "format" => format.to_string())
        .set(size as f64);
    tracing::debug!(image, format, size, file = %path.display(), "image size measured");
    Ok(size)
}

pub fn record_upload(image: &str, provider: &str, elapsed: Duration) {
    histogram!(UPLOAD_DURATION, "image" => image.to_string(), "provider" => provider.to_string())
        .record(elapsed.as_secs_f64());
    counter!(UPLOADS, "image" => image.to_string(), "provider" => provider.to_string())
        .increment(1);
    tracing::debug!(image, provider, duration_secs = elapsed.as_secs_f64(), "upload measured");
}

#[cfg(test)]
pub(crate) mod capture {
    //! In-memory recorder for asserting on emitted measurements.

    use metrics::{
        Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Metadata,
        Recorder, SharedString, Unit,
    };
    use std::sync::{Arc, Mutex};

    pub type Samples = Arc<Mutex<Vec<(String, f64)>>>;

    /// Each sample is keyed `name{label=value,...}`.
    #[derive(Debug, Default)]
    pub struct Capture {
        pub samples: Samples,
    }

    impl Capture {
        pub fn values(&self, key: &str) -> Vec<f64> {
            self.samples
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| *v)
                .collect()
        }

        fn handle(&self, key: &Key) -> Arc<Handle> {
            let labels: Vec<String> =
                key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            Arc::new(Handle {
                key: format!("{}{{{}}}", key.name(), labels.join(",")),
                samples: self.samples.clone(),
            })
        }
    }

    struct Handle {
        key: String,
        samples: Samples,
    }

    impl Handle {
        fn push(&self, value: f64) {
            self.samples.lock().unwrap().push((self.key.clone(), value));
        }
    }

    impl CounterFn for Handle {
        fn increment(&self, value: u64) {
            self.push(value as f64);
        }

        fn absolute(&self, value: u64) {
            self.push(value as f64);
        }
    }

    impl GaugeFn for Handle {
        fn increment(&self, value: f64) {
            self.push(value);
        }

        fn decrement(&self, value: f64) {
            self.push(-value);
        }

        fn set(&self, value: f64) {
            self.push(value);
        }
    }

    impl HistogramFn for Handle {
        fn record(&self, value: f64) {
            self.push(value);
        }
    }

    impl Recorder for Capture {
        fn describe_counter(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_gauge(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}
        fn describe_histogram(&self, _: KeyName, _: Option<Unit>, _: SharedString) {}

        fn register_counter(&self, key: &Key, _: &Metadata<'_>) -> Counter {
            Counter::from_arc(self.handle(key))
        }

        fn register_gauge(&self, key: &Key, _: &Metadata<'_>) -> Gauge {
            Gauge::from_arc(self.handle(key))
        }

        fn register_histogram(&self, key: &Key, _: &Metadata<'_>) -> Histogram {
            Histogram::from_arc(self.handle(key))
        }
    }
}
