use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use docview_core::{
    DocumentHandle, LoadingHandle, PageRenderer, RenderImage, RenderRequest, ViewerConfig,
    ViewerError, VisibilityRecord,
};

/// Axis-aligned rectangle in container layout units.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Fraction of this rectangle covered by the intersection with `other`.
    /// Degenerate rectangles yield 0.0.
    pub fn intersection_ratio(&self, other: &Rect) -> f32 {
        if self.width <= 0.0 || self.height <= 0.0 {
            return 0.0;
        }
        let left = self.x.max(other.x);
        let top = self.y.max(other.y);
        let right = (self.x + self.width).min(other.x + other.width);
        let bottom = (self.y + self.height).min(other.y + other.height);
        if right <= left || bottom <= top {
            return 0.0;
        }
        ((right - left) * (bottom - top)) / (self.width * self.height)
    }
}

pub type VisibilityCallback = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Capability seam for visibility detection, so the observation mechanism
/// is swappable without touching navigation logic.
pub trait VisibilityObserver: Send + Sync {
    fn observe(&self, container: &str, callback: VisibilityCallback) -> SubscriptionId;
    fn unobserve(&self, container: &str, subscription: SubscriptionId);
}

struct Subscription {
    id: SubscriptionId,
    callback: VisibilityCallback,
}

#[derive(Default)]
struct Container {
    viewport: Rect,
    pages: BTreeMap<usize, Rect>,
    indicators: HashSet<LoadingHandle>,
    subscriptions: Vec<Subscription>,
    visible: BTreeSet<usize>,
}

/// Tracks which pages of a named container intersect its viewport, owns the
/// loading-indicator registry, and delivers threshold-crossing callbacks.
///
/// Observation is push-based: the embedding shell calls
/// [`ViewportTracker::update_viewport`] whenever its scroll position or
/// geometry changes, and callbacks fire on that caller's thread. Crossings
/// are level-triggered per page; a page that leaves and re-enters visibility
/// fires again. When several pages cross within one tick the callbacks fire
/// in ascending page order.
pub struct ViewportTracker {
    threshold: f32,
    next_subscription: AtomicU64,
    containers: Mutex<HashMap<String, Container>>,
}

impl ViewportTracker {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
            next_subscription: AtomicU64::new(1),
            containers: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(config: &ViewerConfig) -> Self {
        Self::new(config.visibility_threshold)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn define_container(&self, id: &str, viewport: Rect) {
        let mut containers = self.containers.lock();
        containers.entry(id.to_owned()).or_default().viewport = viewport;
    }

    /// Registers the placeholder bounds for a 1-indexed page. Page 0 is not
    /// a valid placeholder and is ignored.
    pub fn set_page_bounds(&self, id: &str, page: usize, bounds: Rect) {
        if page == 0 {
            debug!(container = id, "ignoring placeholder for page 0");
            return;
        }
        let mut containers = self.containers.lock();
        containers
            .entry(id.to_owned())
            .or_default()
            .pages
            .insert(page, bounds);
    }

    pub fn show_loading(&self, container: &str) -> LoadingHandle {
        let handle = LoadingHandle::new();
        let mut containers = self.containers.lock();
        containers
            .entry(container.to_owned())
            .or_default()
            .indicators
            .insert(handle);
        trace!(%handle, container, "loading indicator shown");
        handle
    }

    /// Removes exactly the indicator identified by `handle`. Removing an
    /// unknown or already-removed handle is a logged no-op; returns whether
    /// anything was removed.
    pub fn hide_loading(&self, handle: LoadingHandle, container: &str) -> bool {
        let mut containers = self.containers.lock();
        let removed = containers
            .get_mut(container)
            .map(|entry| entry.indicators.remove(&handle))
            .unwrap_or(false);
        if removed {
            trace!(%handle, container, "loading indicator removed");
        } else {
            trace!(%handle, container, "hide ignored: handle not active");
        }
        removed
    }

    /// Strict variant of [`ViewportTracker::hide_loading`] for callers that
    /// opt into hard errors on stale handles.
    pub fn try_hide_loading(
        &self,
        handle: LoadingHandle,
        container: &str,
    ) -> Result<(), ViewerError> {
        if self.hide_loading(handle, container) {
            Ok(())
        } else {
            Err(ViewerError::InvalidHandle { handle })
        }
    }

    pub fn active_indicators(&self, container: &str) -> usize {
        let containers = self.containers.lock();
        containers
            .get(container)
            .map(|entry| entry.indicators.len())
            .unwrap_or(0)
    }

    pub fn observe_visibility(&self, container: &str, callback: VisibilityCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut containers = self.containers.lock();
        containers
            .entry(container.to_owned())
            .or_default()
            .subscriptions
            .push(Subscription { id, callback });
        id
    }

    pub fn unobserve(&self, container: &str, subscription: SubscriptionId) {
        let mut containers = self.containers.lock();
        if let Some(entry) = containers.get_mut(container) {
            entry.subscriptions.retain(|sub| sub.id != subscription);
        }
    }

    /// One observation tick. Stores the new viewport, recomputes which pages
    /// sit at or above the visibility threshold, and fires the container's
    /// callbacks for every page that crossed into visibility.
    pub fn update_viewport(&self, container: &str, viewport: Rect) {
        let mut fired: Vec<(VisibilityCallback, usize)> = Vec::new();
        {
            let mut containers = self.containers.lock();
            let Some(entry) = containers.get_mut(container) else {
                debug!(container, "viewport update for unknown container ignored");
                return;
            };
            entry.viewport = viewport;
            let mut now_visible = BTreeSet::new();
            for (&page, bounds) in &entry.pages {
                let ratio = bounds.intersection_ratio(&viewport);
                if ratio > 0.0 && ratio >= self.threshold {
                    now_visible.insert(page);
                }
            }
            for &page in now_visible.difference(&entry.visible) {
                for subscription in &entry.subscriptions {
                    fired.push((Arc::clone(&subscription.callback), page));
                }
            }
            entry.visible = now_visible;
        }
        // Callbacks run outside the lock so they may call back into the
        // tracker.
        for (callback, page) in fired {
            callback(page);
        }
    }

    /// Snapshot of the pages currently at or above the threshold, ascending
    /// with no duplicates. Placeholders beyond the document's page count
    /// (stale layout after a document swap) are not reported.
    pub fn visible_pages(&self, container: &str, document: &dyn DocumentHandle) -> Vec<usize> {
        let containers = self.containers.lock();
        let Some(entry) = containers.get(container) else {
            return Vec::new();
        };
        let page_count = document.page_count();
        entry
            .pages
            .iter()
            .filter(|(&page, _)| page <= page_count)
            .filter(|(_, bounds)| {
                let ratio = bounds.intersection_ratio(&entry.viewport);
                ratio > 0.0 && ratio >= self.threshold
            })
            .map(|(&page, _)| page)
            .collect()
    }

    /// Intersection ratios for every page touching the viewport this tick.
    pub fn visibility_records(&self, container: &str) -> Vec<VisibilityRecord> {
        let containers = self.containers.lock();
        let Some(entry) = containers.get(container) else {
            return Vec::new();
        };
        entry
            .pages
            .iter()
            .filter_map(|(&page, bounds)| {
                let ratio = bounds.intersection_ratio(&entry.viewport);
                (ratio > 0.0).then_some(VisibilityRecord { page, ratio })
            })
            .collect()
    }
}

impl VisibilityObserver for ViewportTracker {
    fn observe(&self, container: &str, callback: VisibilityCallback) -> SubscriptionId {
        self.observe_visibility(container, callback)
    }

    fn unobserve(&self, container: &str, subscription: SubscriptionId) {
        ViewportTracker::unobserve(self, container, subscription)
    }
}

/// Splits a `key1=value1&key2=value2` style string (with or without a
/// leading `?`) into an ordered mapping. Keys and values are
/// percent-decoded; when a key repeats, the last occurrence wins.
pub fn parse_query_string(query: &str) -> IndexMap<String, String> {
    let trimmed = query.strip_prefix('?').unwrap_or(query);
    let mut params = IndexMap::new();
    if trimmed.is_empty() {
        return params;
    }
    for (key, value) in url::form_urlencoded::parse(trimmed.as_bytes()) {
        params.insert(key.into_owned(), value.into_owned());
    }
    params
}

#[derive(Debug)]
pub enum RenderOutcome {
    Committed(RenderImage),
    /// A later request for the same page was issued while this render was in
    /// flight; its result must not be presented.
    Superseded,
}

impl RenderOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, RenderOutcome::Committed(_))
    }

    pub fn into_image(self) -> Option<RenderImage> {
        match self {
            RenderOutcome::Committed(image) => Some(image),
            RenderOutcome::Superseded => None,
        }
    }
}

/// Issues asynchronous render requests against a [`PageRenderer`]. Requests
/// for different pages may be in flight concurrently and complete in any
/// order; per page, a newer request supersedes an older one.
pub struct RenderDispatcher {
    renderer: Arc<dyn PageRenderer>,
    generations: Mutex<HashMap<usize, u64>>,
    tickets: AtomicU64,
}

impl RenderDispatcher {
    pub fn new(renderer: Arc<dyn PageRenderer>) -> Self {
        Self {
            renderer,
            generations: Mutex::new(HashMap::new()),
            tickets: AtomicU64::new(1),
        }
    }

    /// Renders `page` at `scale * device_pixel_ratio` effective resolution.
    /// Out-of-range pages and degenerate scales fail before the engine is
    /// invoked, so no pixel target is ever touched for them.
    pub async fn render_page(
        &self,
        document: &dyn DocumentHandle,
        page: usize,
        scale: f32,
        device_pixel_ratio: f32,
    ) -> Result<RenderOutcome, ViewerError> {
        let page_count = document.page_count();
        if page == 0 || page > page_count {
            return Err(ViewerError::RenderFailure {
                page,
                source: anyhow!(
                    "page {page} is out of range for a document with {page_count} pages"
                ),
            });
        }
        let effective_scale = scale * device_pixel_ratio;
        if !effective_scale.is_finite() || effective_scale <= 0.0 {
            return Err(ViewerError::RenderFailure {
                page,
                source: anyhow!("invalid effective scale {effective_scale}"),
            });
        }

        let ticket = self.tickets.fetch_add(1, Ordering::SeqCst);
        self.generations.lock().insert(page, ticket);

        let request = RenderRequest {
            page,
            scale: effective_scale,
            rotation: document.page_rotation(page).unwrap_or_default(),
        };
        match self.renderer.render(request).await {
            Ok(image) => {
                if self.generations.lock().get(&page) == Some(&ticket) {
                    Ok(RenderOutcome::Committed(image))
                } else {
                    trace!(page, "render superseded by a newer request");
                    Ok(RenderOutcome::Superseded)
                }
            }
            Err(source) => Err(ViewerError::RenderFailure { page, source }),
        }
    }
}
