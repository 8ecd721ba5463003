use std::collections::HashMap;
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Instant;

use cadence::{
    BufferedUdpMetricSink, Counted, Metric, NopMetricSink, QueuingMetricSink, StatsdClient, Timed,
};

pub use cadence::MetricError;

/// Options needed to build a statsd-backed [`Metrics`] handle. `None` host
/// falls back to a no-op sink, same as the teacher's settings-driven construction.
pub struct MetricsOpts<'a> {
    pub statsd_host: Option<&'a str>,
    pub statsd_port: u16,
    pub label: &'a str,
}

pub fn metrics_from_opts(opts: &MetricsOpts<'_>) -> Result<Metrics, MetricError> {
    let client = match opts.statsd_host {
        Some(host) => {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            socket.set_nonblocking(true)?;
            let sink = BufferedUdpMetricSink::from((host, opts.statsd_port), socket)?;
            let sink = QueuingMetricSink::from(sink);
            StatsdClient::builder(opts.label, sink).build()
        }
        None => StatsdClient::builder(opts.label, NopMetricSink).build(),
    };
    Ok(Metrics {
        client: Some(Arc::new(client)),
        tags: HashMap::new(),
        timer: None,
    })
}

#[derive(Debug, Clone)]
pub struct MetricTimer {
    pub label: String,
    pub start: Instant,
    pub tags: HashMap<String, String>,
}

/// A cheaply-cloneable metrics handle. Cloning shares the underlying statsd
/// client; each clone can carry its own tags and in-flight timer.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
    pub client: Option<Arc<StatsdClient>>,
    pub tags: HashMap<String, String>,
    pub timer: Option<MetricTimer>,
}

impl Drop for Metrics {
    fn drop(&mut self) {
        if let (Some(client), Some(timer)) = (self.client.as_ref(), self.timer.as_ref()) {
            let lapse = (Instant::now() - timer.start).as_millis() as u64;
            let mut tagged = client.time_with_tags(&timer.label, lapse);
            for (key, value) in &timer.tags {
                tagged = tagged.with_tag(key, value);
            }
            if let Err(e) = tagged.try_send() {
                warn!("metric {} error: {:?}", &timer.label, e);
            }
        }
    }
}

impl Metrics {
    pub fn noop() -> Self {
        Self {
            client: Some(Arc::new(StatsdClient::builder("", NopMetricSink).build())),
            tags: HashMap::new(),
            timer: None,
        }
    }

    pub fn start_timer(&mut self, label: &str, tags: Option<HashMap<String, String>>) {
        let mut merged = self.tags.clone();
        if let Some(t) = tags {
            merged.extend(t);
        }
        self.timer = Some(MetricTimer {
            label: label.to_owned(),
            start: Instant::now(),
            tags: merged,
        });
    }

    pub fn incr(&self, label: &str) {
        self.incr_with_tags(label, HashMap::default());
    }

    pub fn incr_by(&self, label: &str, count: i64) {
        self.count_with_tags(label, count, HashMap::default());
    }

    pub fn incr_with_tags(&self, label: &str, tags: HashMap<String, String>) {
        self.count_with_tags(label, 1, tags);
    }

    pub fn count_with_tags(&self, label: &str, count: i64, tags: HashMap<String, String>) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let mut merged = self.tags.clone();
        merged.extend(tags);
        let mut counter = client.count_with_value(label, count);
        for (key, value) in &merged {
            counter = counter.with_tag(key, value);
        }
        if let Err(e) = counter.try_send() {
            warn!("metric {} error: {:?}", label, e);
        }
    }

    pub fn time_duration(&self, label: &str, duration: std::time::Duration) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        let mut timed = client.time_with_tags(label, duration.as_millis() as u64);
        for (key, value) in &self.tags {
            timed = timed.with_tag(key, value);
        }
        if let Err(e) = timed.try_send() {
            warn!("metric {} error: {:?}", label, e);
        }
    }
}
