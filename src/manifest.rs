use std::collections::HashMap;

/// Reserved artifact id naming the application bundle root.
pub const APP_RECORD_ID: &str = "app";

/// Reconstruction manifest built during collection: artifact id (the
/// basename a download landed under) to its destination relative to the
/// app directory. The reserved [`APP_RECORD_ID`] entry instead holds the
/// local directory name of the bundle itself.
///
/// Insertion order is irrelevant; segments may be recorded before or
/// after the app root. Assembly validates the app root is present.
#[derive(Debug, Default)]
pub struct Manifest {
    records: HashMap<String, String>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_segment(&mut self, artifact_id: impl Into<String>, dest: impl Into<String>) {
        self.records.insert(artifact_id.into(), dest.into());
    }

    pub fn record_app_root(&mut self, dir_name: impl Into<String>) {
        self.records.insert(APP_RECORD_ID.to_string(), dir_name.into());
    }

    /// Local directory name of the application bundle, once announced.
    pub fn app_root(&self) -> Option<&str> {
        self.records.get(APP_RECORD_ID).map(String::as_str)
    }

    /// All non-app records as `(artifact_id, destination_relative_path)`.
    pub fn segments(&self) -> impl Iterator<Item = (&str, &str)> {
        self.records
            .iter()
            .filter(|(id, _)| id.as_str() != APP_RECORD_ID)
            .map(|(id, dest)| (id.as_str(), dest.as_str()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_root_is_separated_from_segments() {
        let mut manifest = Manifest::new();
        manifest.record_segment("Bar.dylib", "Frameworks/Bar.dylib");
        manifest.record_app_root("Foo.app");
        manifest.record_segment("Foo", "Foo");

        assert_eq!(manifest.app_root(), Some("Foo.app"));
        let mut segments: Vec<_> = manifest.segments().collect();
        segments.sort();
        assert_eq!(
            segments,
            vec![("Bar.dylib", "Frameworks/Bar.dylib"), ("Foo", "Foo")]
        );
    }

    #[test]
    fn insertion_order_does_not_matter() {
        let mut early = Manifest::new();
        early.record_app_root("Foo.app");
        early.record_segment("Foo", "Foo");

        let mut late = Manifest::new();
        late.record_segment("Foo", "Foo");
        late.record_app_root("Foo.app");

        assert_eq!(early.app_root(), late.app_root());
        assert_eq!(early.len(), late.len());
    }

    #[test]
    fn missing_app_root_is_observable() {
        let mut manifest = Manifest::new();
        manifest.record_segment("Foo", "Foo");
        assert!(manifest.app_root().is_none());
    }
}
