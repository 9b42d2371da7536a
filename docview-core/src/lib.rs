use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use url::Url;
use uuid::Uuid;

/// The rel attribute applied to every externally resolved link. Prevents
/// reverse-tabnabbing and referrer leakage; not configurable.
pub const LINK_REL: &str = "noopener noreferrer nofollow";

static SAFE_SCHEMES: Lazy<HashSet<&'static str>> =
    Lazy::new(|| ["http", "https", "ftp", "mailto", "tel"].into_iter().collect());

#[derive(Debug, Clone, PartialEq)]
pub enum NavigationTarget {
    /// 1-indexed page number.
    Page(usize),
    /// Named destination resolved through the document handle.
    Named(String),
    External { url: String, new_window: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindowTarget {
    #[default]
    None,
    SelfFrame,
    Blank,
    Parent,
    Top,
}

impl WindowTarget {
    pub fn attribute(self) -> &'static str {
        match self {
            WindowTarget::None => "",
            WindowTarget::SelfFrame => "_self",
            WindowTarget::Blank => "_blank",
            WindowTarget::Parent => "_parent",
            WindowTarget::Top => "_top",
        }
    }
}

/// Attribute set an embedding shell must apply to an externally resolved
/// anchor. A disabled link is rendered inert by the shell.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkAttributes {
    pub href: String,
    pub target: WindowTarget,
    pub rel: &'static str,
    pub enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Quarter,
    Half,
    ThreeQuarters,
}

impl Rotation {
    pub fn from_degrees(degrees: i32) -> Self {
        match degrees.rem_euclid(360) {
            90 => Rotation::Quarter,
            180 => Rotation::Half,
            270 => Rotation::ThreeQuarters,
            _ => Rotation::None,
        }
    }

    pub fn degrees(self) -> i32 {
        match self {
            Rotation::None => 0,
            Rotation::Quarter => 90,
            Rotation::Half => 180,
            Rotation::ThreeQuarters => 270,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RenderRequest {
    /// 1-indexed page number.
    pub page: usize,
    /// Effective scale, device pixel ratio already applied.
    pub scale: f32,
    pub rotation: Rotation,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            page: 1,
            scale: 1.0,
            rotation: Rotation::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderImage {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Per-tick visibility datum; no identity beyond the tick that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VisibilityRecord {
    pub page: usize,
    pub ratio: f32,
}

/// Opaque token identifying one loading indicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoadingHandle(Uuid);

impl LoadingHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LoadingHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LoadingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Error)]
pub enum ViewerError {
    #[error("page {page} is out of range for a document with {page_count} pages")]
    OutOfRangeTarget { page: usize, page_count: usize },
    #[error("named destination {name:?} did not resolve")]
    UnresolvedDestination { name: String },
    #[error("loading handle {handle} is not active")]
    InvalidHandle { handle: LoadingHandle },
    #[error("rendering page {page} failed")]
    RenderFailure {
        page: usize,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    PageChanged { page: usize },
    RotationChanged { rotation: Rotation },
    ExternalLinkRequested { url: String, new_window: bool },
}

/// Opaque reference to a loaded document. Owned by the embedding
/// application; this crate only ever reads through it.
pub trait DocumentHandle: Send + Sync {
    fn page_count(&self) -> usize;
    /// Resolves a named destination to a 1-indexed page number.
    fn destination(&self, name: &str) -> Option<usize>;
    fn page_rotation(&self, page: usize) -> Option<Rotation>;
}

/// The visual host tracking the currently displayed page.
pub trait ViewerSurface: Send + Sync {
    /// None until the surface has displayed a page.
    fn current_page(&self) -> Option<usize>;
    fn set_current_page(&self, page: usize);
    fn rotation(&self) -> Rotation;
    fn set_rotation(&self, rotation: Rotation);
    fn in_presentation_mode(&self) -> bool {
        false
    }
}

/// Consumed, never implemented, by this workspace.
pub trait DownloadManager: Send + Sync {
    fn download_data(&self, data: &[u8], filename: &str, content_type: &str) -> Result<()>;
    fn open_or_download_data(&self, data: &[u8], filename: &str, dest: &str) -> Result<bool>;
    fn download(&self, data: &[u8], url: &str, filename: &str) -> Result<()>;
}

#[async_trait]
pub trait Localizer: Send + Sync {
    async fn get(&self, id: &str, args: &HashMap<String, String>, fallback: &str) -> String;
}

pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: ViewerEvent);
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    async fn render(&self, request: RenderRequest) -> Result<RenderImage>;
}

/// Event sink backed by a plain vector, for tests and simple shells.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<ViewerEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<ViewerEvent> {
        std::mem::take(&mut *self.events.lock())
    }

    pub fn snapshot(&self) -> Vec<ViewerEvent> {
        self.events.lock().clone()
    }
}

impl EventSink for EventLog {
    fn dispatch(&self, event: ViewerEvent) {
        self.events.lock().push(event);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub external_links_enabled: bool,
    pub external_link_target: WindowTarget,
    /// Intersection-ratio cutoff above which a page counts as visible.
    pub visibility_threshold: f32,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            external_links_enabled: true,
            external_link_target: WindowTarget::None,
            visibility_threshold: 0.5,
        }
    }
}

impl ViewerConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {:?}", path))?;
        let config = toml::from_str(&raw)
            .with_context(|| format!("failed to decode config file {:?}", path))?;
        Ok(config)
    }

    /// Loads the config from the platform config directory; an absent file
    /// yields the default policy.
    pub fn load_default() -> Result<Self> {
        let Some(project_dirs) = directories::ProjectDirs::from("net", "docview", "docview")
        else {
            return Ok(Self::default());
        };
        let path = project_dirs.config_dir().join("docview.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_path(&path)
    }
}

/// Returns whether the URL parses and carries a scheme this viewer is
/// willing to hand to the embedding shell.
pub fn is_safe_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(parsed) => SAFE_SCHEMES.contains(parsed.scheme()),
        Err(_) => false,
    }
}

/// Resolves navigation intents against a live document handle and a viewer
/// surface. Navigation failures are swallowed by contract: a stale or
/// malformed link must never crash the viewer, so out-of-range pages and
/// unresolved destinations degrade to logged no-ops.
pub struct LinkService {
    surface: Arc<dyn ViewerSurface>,
    document: Mutex<Option<Arc<dyn DocumentHandle>>>,
    events: Option<Arc<dyn EventSink>>,
    external_links_enabled: AtomicBool,
    external_link_target: WindowTarget,
}

impl LinkService {
    pub fn new(surface: Arc<dyn ViewerSurface>) -> Self {
        Self {
            surface,
            document: Mutex::new(None),
            events: None,
            external_links_enabled: AtomicBool::new(true),
            external_link_target: WindowTarget::None,
        }
    }

    pub fn with_document(self, document: Arc<dyn DocumentHandle>) -> Self {
        *self.document.lock() = Some(document);
        self
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn with_config(mut self, config: &ViewerConfig) -> Self {
        self.external_links_enabled
            .store(config.external_links_enabled, Ordering::Relaxed);
        self.external_link_target = config.external_link_target;
        self
    }

    /// Replaces the document the service resolves against. Pass None while
    /// a new document is loading.
    pub fn set_document(&self, document: Option<Arc<dyn DocumentHandle>>) {
        *self.document.lock() = document;
    }

    pub fn document(&self) -> Option<Arc<dyn DocumentHandle>> {
        self.document.lock().clone()
    }

    /// The surface's active page, or -1 if it has not displayed one yet.
    pub fn current_page_number(&self) -> i64 {
        self.surface
            .current_page()
            .map(|page| page as i64)
            .unwrap_or(-1)
    }

    pub fn go_to_page(&self, page: usize) {
        let Some(document) = self.document() else {
            debug!(page, "navigation ignored: no document attached");
            return;
        };
        let page_count = document.page_count();
        if page == 0 || page > page_count {
            debug!(
                error = %ViewerError::OutOfRangeTarget { page, page_count },
                "navigation ignored"
            );
            return;
        }
        self.surface.set_current_page(page);
        self.dispatch(ViewerEvent::PageChanged { page });
    }

    pub fn go_to_destination(&self, name: &str) {
        let Some(document) = self.document() else {
            debug!(name, "navigation ignored: no document attached");
            return;
        };
        match document.destination(name) {
            Some(page) => self.go_to_page(page),
            None => debug!(
                error = %ViewerError::UnresolvedDestination { name: name.to_owned() },
                "navigation ignored"
            ),
        }
    }

    pub fn navigate(&self, target: &NavigationTarget) {
        match target {
            NavigationTarget::Page(page) => self.go_to_page(*page),
            NavigationTarget::Named(name) => self.go_to_destination(name),
            NavigationTarget::External { url, new_window } => {
                if !self.external_links_enabled() {
                    debug!(%url, "external navigation disabled");
                    return;
                }
                if !is_safe_url(url) {
                    debug!(%url, "blocked external navigation to unsafe url");
                    return;
                }
                self.dispatch(ViewerEvent::ExternalLinkRequested {
                    url: url.clone(),
                    new_window: *new_window,
                });
            }
        }
    }

    /// Builds the attribute set for an externally resolved anchor. The rel
    /// value is always [`LINK_REL`].
    pub fn add_link_attributes(&self, url: &str, new_window: bool) -> LinkAttributes {
        let target = if new_window {
            WindowTarget::Blank
        } else {
            self.external_link_target
        };
        let enabled = self.external_links_enabled() && is_safe_url(url);
        LinkAttributes {
            href: url.to_owned(),
            target,
            rel: LINK_REL,
            enabled,
        }
    }

    pub fn external_links_enabled(&self) -> bool {
        self.external_links_enabled.load(Ordering::Relaxed)
    }

    pub fn set_external_links_enabled(&self, enabled: bool) {
        self.external_links_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn pages_rotation(&self) -> Rotation {
        self.surface.rotation()
    }

    pub fn set_pages_rotation(&self, rotation: Rotation) {
        self.surface.set_rotation(rotation);
        self.dispatch(ViewerEvent::RotationChanged { rotation });
    }

    fn dispatch(&self, event: ViewerEvent) {
        if let Some(sink) = &self.events {
            sink.dispatch(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct FakeSurface {
        page: Mutex<Option<usize>>,
        rotation: Mutex<Rotation>,
    }

    impl ViewerSurface for FakeSurface {
        fn current_page(&self) -> Option<usize> {
            *self.page.lock()
        }

        fn set_current_page(&self, page: usize) {
            *self.page.lock() = Some(page);
        }

        fn rotation(&self) -> Rotation {
            *self.rotation.lock()
        }

        fn set_rotation(&self, rotation: Rotation) {
            *self.rotation.lock() = rotation;
        }
    }

    struct FakeDocument {
        page_count: usize,
        destinations: HashMap<String, usize>,
    }

    impl FakeDocument {
        fn new(page_count: usize) -> Self {
            Self {
                page_count,
                destinations: HashMap::new(),
            }
        }

        fn with_destination(mut self, name: &str, page: usize) -> Self {
            self.destinations.insert(name.to_owned(), page);
            self
        }
    }

    impl DocumentHandle for FakeDocument {
        fn page_count(&self) -> usize {
            self.page_count
        }

        fn destination(&self, name: &str) -> Option<usize> {
            self.destinations.get(name).copied()
        }

        fn page_rotation(&self, _page: usize) -> Option<Rotation> {
            Some(Rotation::None)
        }
    }

    fn service_with_pages(page_count: usize) -> (LinkService, Arc<EventLog>) {
        let events = Arc::new(EventLog::new());
        let service = LinkService::new(Arc::new(FakeSurface::default()))
            .with_document(Arc::new(FakeDocument::new(page_count)))
            .with_event_sink(events.clone());
        (service, events)
    }

    #[test]
    fn go_to_page_updates_surface_within_range() {
        let (service, events) = service_with_pages(10);
        assert_eq!(service.current_page_number(), -1);

        service.go_to_page(1);
        assert_eq!(service.current_page_number(), 1);
        service.go_to_page(10);
        assert_eq!(service.current_page_number(), 10);

        assert_eq!(
            events.take(),
            vec![
                ViewerEvent::PageChanged { page: 1 },
                ViewerEvent::PageChanged { page: 10 },
            ]
        );
    }

    #[test]
    fn out_of_range_pages_are_silently_ignored() {
        let (service, events) = service_with_pages(10);
        service.go_to_page(5);

        service.go_to_page(0);
        service.go_to_page(11);
        assert_eq!(service.current_page_number(), 5);
        assert_eq!(events.take(), vec![ViewerEvent::PageChanged { page: 5 }]);
    }

    #[test]
    fn navigation_without_document_is_a_noop() {
        let service = LinkService::new(Arc::new(FakeSurface::default()));
        service.go_to_page(1);
        service.go_to_destination("intro");
        assert_eq!(service.current_page_number(), -1);
    }

    #[test]
    fn named_destination_resolves_through_document() {
        let events = Arc::new(EventLog::new());
        let document = FakeDocument::new(20).with_destination("chapter-2", 7);
        let service = LinkService::new(Arc::new(FakeSurface::default()))
            .with_document(Arc::new(document))
            .with_event_sink(events.clone());

        service.go_to_destination("chapter-2");
        assert_eq!(service.current_page_number(), 7);

        service.go_to_destination("missing");
        assert_eq!(service.current_page_number(), 7);
        assert_eq!(events.take(), vec![ViewerEvent::PageChanged { page: 7 }]);
    }

    #[test]
    fn document_is_replaceable_at_runtime() {
        let (service, _) = service_with_pages(3);
        service.go_to_page(3);
        assert_eq!(service.current_page_number(), 3);

        service.set_document(Some(Arc::new(FakeDocument::new(8))));
        service.go_to_page(8);
        assert_eq!(service.current_page_number(), 8);

        service.set_document(None);
        service.go_to_page(1);
        assert_eq!(service.current_page_number(), 8);
    }

    #[test]
    fn link_attributes_always_carry_the_security_rel() {
        let (service, _) = service_with_pages(1);
        for (url, new_window) in [
            ("https://example.com/", true),
            ("https://example.com/", false),
            ("javascript:alert(1)", true),
        ] {
            let attributes = service.add_link_attributes(url, new_window);
            assert_eq!(attributes.rel, "noopener noreferrer nofollow");
        }
    }

    #[test]
    fn link_attributes_pick_target_from_policy() {
        let (service, _) = service_with_pages(1);
        assert_eq!(
            service.add_link_attributes("https://example.com/", true).target,
            WindowTarget::Blank
        );
        assert_eq!(
            service.add_link_attributes("https://example.com/", false).target,
            WindowTarget::None
        );

        let config = ViewerConfig {
            external_link_target: WindowTarget::Top,
            ..ViewerConfig::default()
        };
        let service = LinkService::new(Arc::new(FakeSurface::default())).with_config(&config);
        assert_eq!(
            service.add_link_attributes("https://example.com/", false).target,
            WindowTarget::Top
        );
    }

    #[test]
    fn disabled_or_unsafe_external_links_are_inert() {
        let (service, events) = service_with_pages(1);

        let attributes = service.add_link_attributes("javascript:alert(1)", false);
        assert!(!attributes.enabled);

        service.set_external_links_enabled(false);
        let attributes = service.add_link_attributes("https://example.com/", false);
        assert!(!attributes.enabled);

        service.navigate(&NavigationTarget::External {
            url: "https://example.com/".to_owned(),
            new_window: false,
        });
        assert!(events.take().is_empty());

        // Internal navigation keeps working while external links are off.
        service.navigate(&NavigationTarget::Page(1));
        assert_eq!(service.current_page_number(), 1);
    }

    #[test]
    fn safe_external_navigation_reaches_the_event_sink() {
        let (service, events) = service_with_pages(1);
        service.navigate(&NavigationTarget::External {
            url: "https://example.com/paper.pdf".to_owned(),
            new_window: true,
        });
        assert_eq!(
            events.take(),
            vec![ViewerEvent::ExternalLinkRequested {
                url: "https://example.com/paper.pdf".to_owned(),
                new_window: true,
            }]
        );
    }

    #[test]
    fn rotation_passes_through_to_the_surface() {
        let (service, events) = service_with_pages(1);
        assert_eq!(service.pages_rotation(), Rotation::None);
        service.set_pages_rotation(Rotation::Quarter);
        assert_eq!(service.pages_rotation(), Rotation::Quarter);
        assert_eq!(
            events.take(),
            vec![ViewerEvent::RotationChanged {
                rotation: Rotation::Quarter
            }]
        );
    }

    #[test]
    fn url_safety_covers_scheme_whitelist() {
        assert!(is_safe_url("https://example.com/a?b=c"));
        assert!(is_safe_url("mailto:someone@example.com"));
        assert!(!is_safe_url("javascript:alert(1)"));
        assert!(!is_safe_url("file:///etc/passwd"));
        assert!(!is_safe_url("not a url"));
    }

    #[test]
    fn rotation_degrees_round_trip() {
        for degrees in [0, 90, 180, 270] {
            assert_eq!(Rotation::from_degrees(degrees).degrees(), degrees);
        }
        assert_eq!(Rotation::from_degrees(-90), Rotation::ThreeQuarters);
        assert_eq!(Rotation::from_degrees(450), Rotation::Quarter);
        assert_eq!(Rotation::from_degrees(45), Rotation::None);
    }

    #[test]
    fn loading_handles_are_distinct() {
        assert_ne!(LoadingHandle::new(), LoadingHandle::new());
    }

    #[test]
    fn config_decodes_partial_files_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docview.toml");
        std::fs::write(
            &path,
            "external_links_enabled = false\nexternal_link_target = \"blank\"\n",
        )
        .unwrap();
        let config = ViewerConfig::from_path(&path).unwrap();
        assert!(!config.external_links_enabled);
        assert_eq!(config.external_link_target, WindowTarget::Blank);
        assert_eq!(config.visibility_threshold, 0.5);
    }

    struct StaticLocalizer;

    #[async_trait]
    impl Localizer for StaticLocalizer {
        async fn get(&self, id: &str, args: &HashMap<String, String>, fallback: &str) -> String {
            if id != "page_status" {
                return fallback.to_owned();
            }
            let mut text = "page {page}".to_owned();
            for (key, value) in args {
                text = text.replace(&format!("{{{key}}}"), value);
            }
            text
        }
    }

    #[tokio::test]
    async fn localizer_contract_substitutes_arguments() {
        let localizer = StaticLocalizer;
        let mut args = HashMap::new();
        args.insert("page".to_owned(), "3".to_owned());
        assert_eq!(localizer.get("page_status", &args, "page ?").await, "page 3");
        assert_eq!(localizer.get("unknown", &args, "page ?").await, "page ?");
    }
}
