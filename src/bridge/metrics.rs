use super::VuContext;
use crate::stats::{Sample, Tags};

/// Custom metrics. Each helper records one sample with the given tags plus
/// the run's control tags.
impl VuContext {
    pub fn add_counter(&self, name: &str, value: f64, tags: &Tags) {
        self.record(Sample::counter(name, value).with_tags(tags));
    }

    pub fn set_gauge(&self, name: &str, value: f64, tags: &Tags) {
        self.record(Sample::gauge(name, value).with_tags(tags));
    }

    pub fn add_trend(&self, name: &str, value: f64, tags: &Tags) {
        self.record(Sample::trend(name, value).with_tags(tags));
    }

    pub fn add_rate(&self, name: &str, success: bool, tags: &Tags) {
        self.record(Sample::rate(name, success).with_tags(tags));
    }
}

#[cfg(test)]
mod tests {
    use crate::bridge::test_support::context;
    use crate::bridge::FixtureSet;
    use crate::stats::{MetricKind, Tags};

    #[test]
    fn test_custom_metrics() {
        let (vu, recorder, _) = context(FixtureSet::empty());
        let none = Tags::new();
        let mut tagged = Tags::new();
        tagged.insert("kind".into(), "comment".into());

        vu.add_counter("posts_created", 2.0, &none);
        vu.add_counter("posts_created", 3.0, &tagged);
        vu.set_gauge("queue_depth", 7.0, &none);
        vu.add_trend("render_ms", 12.5, &none);
        vu.add_rate("cache_hit", false, &none);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.get("posts_created").unwrap().sum(), 5.0);
        assert_eq!(snapshot.get("posts_created{kind:comment}").unwrap().sum(), 3.0);
        assert_eq!(snapshot.get("queue_depth").unwrap().kind(), MetricKind::Gauge);
        assert_eq!(snapshot.get("render_ms").unwrap().mean(), Some(12.5));
        assert_eq!(snapshot.get("cache_hit").unwrap().rate(), Some(0.0));
    }
}
