use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use directories::ProjectDirs;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

use docview_core::{
    DocumentHandle, DownloadManager, EventLog, LinkService, Localizer, PageRenderer, RenderImage,
    RenderRequest, Rotation, ViewerConfig, ViewerSurface,
};
use docview_ui::{parse_query_string, Rect, RenderDispatcher, RenderOutcome, ViewportTracker};

const CONTAINER: &str = "viewer";
const PAGE_GAP: f32 = 20.0;

#[derive(Debug, Parser)]
#[command(
    name = "docview",
    version,
    about = "navigation and viewport inspection shell for document manifests"
)]
struct Args {
    /// Path to a JSON document manifest
    manifest: PathBuf,

    /// Page to navigate to (1-based)
    #[arg(short = 'p', long = "page")]
    page: Option<usize>,

    /// Named destination to navigate to
    #[arg(long)]
    dest: Option<String>,

    /// Viewer query string to decode and apply, e.g. "page=3&dest=intro"
    #[arg(long)]
    query: Option<String>,

    /// Top of the inspected viewport in layout units
    #[arg(long, default_value_t = 0.0)]
    viewport_top: f32,

    /// Height of the inspected viewport in layout units
    #[arg(long, default_value_t = 1000.0)]
    viewport_height: f32,

    /// Render scale for the active page
    #[arg(long, default_value_t = 1.0)]
    scale: f32,

    /// Device pixel ratio applied on top of the scale
    #[arg(long, default_value_t = 1.0)]
    dpr: f32,

    /// Write the rendered page as raw RGBA under this filename
    #[arg(long)]
    save_render: Option<String>,
}

/// Stand-in for a decoded document: page geometry and named destinations
/// described in a JSON file.
#[derive(Debug, Deserialize)]
struct DocumentManifest {
    page_count: usize,
    #[serde(default = "default_page_width")]
    page_width: f32,
    #[serde(default = "default_page_height")]
    page_height: f32,
    #[serde(default)]
    destinations: HashMap<String, usize>,
    /// Per-page rotation in degrees, keyed by the 1-based page number.
    #[serde(default)]
    rotations: HashMap<String, i32>,
}

fn default_page_width() -> f32 {
    612.0
}

fn default_page_height() -> f32 {
    792.0
}

impl DocumentManifest {
    fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read manifest {:?}", path))?;
        let manifest: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to decode manifest {:?}", path))?;
        Ok(manifest)
    }
}

impl DocumentHandle for DocumentManifest {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn destination(&self, name: &str) -> Option<usize> {
        self.destinations.get(name).copied()
    }

    fn page_rotation(&self, page: usize) -> Option<Rotation> {
        self.rotations
            .get(&page.to_string())
            .map(|&degrees| Rotation::from_degrees(degrees))
    }
}

#[derive(Default)]
struct ShellSurface {
    page: Mutex<Option<usize>>,
    rotation: Mutex<Rotation>,
}

impl ViewerSurface for ShellSurface {
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

/// Renders solid pages sized from the manifest geometry; stands in for the
/// engine the library crates delegate to.
struct BlankRenderer {
    page_width: f32,
    page_height: f32,
}

#[async_trait]
impl PageRenderer for BlankRenderer {
    async fn render(&self, request: RenderRequest) -> Result<RenderImage> {
        let (width, height) = match request.rotation {
            Rotation::Quarter | Rotation::ThreeQuarters => (self.page_height, self.page_width),
            Rotation::None | Rotation::Half => (self.page_width, self.page_height),
        };
        let width = (width * request.scale).round().max(1.0) as u32;
        let height = (height * request.scale).round().max(1.0) as u32;
        Ok(RenderImage {
            width,
            height,
            pixels: vec![0xff; width as usize * height as usize * 4],
        })
    }
}

struct FileDownloadManager {
    root: PathBuf,
}

impl DownloadManager for FileDownloadManager {
    fn download_data(&self, data: &[u8], filename: &str, content_type: &str) -> Result<()> {
        let path = self.root.join(filename);
        fs::write(&path, data).with_context(|| format!("failed to write {:?}", path))?;
        debug!(?path, content_type, bytes = data.len(), "download written");
        Ok(())
    }

    fn open_or_download_data(&self, data: &[u8], filename: &str, dest: &str) -> Result<bool> {
        debug!(dest, "no embedded handler; falling back to download");
        self.download_data(data, filename, "application/octet-stream")?;
        Ok(false)
    }

    fn download(&self, data: &[u8], url: &str, filename: &str) -> Result<()> {
        debug!(url, "downloading from already-fetched data");
        self.download_data(data, filename, "application/octet-stream")
    }
}

/// Built-in templates only; a real shell plugs in its localization backend.
struct StaticLocalizer;

#[async_trait]
impl Localizer for StaticLocalizer {
    async fn get(&self, id: &str, args: &HashMap<String, String>, fallback: &str) -> String {
        let template = match id {
            "page_status" => "page {page} of {total}",
            _ => return fallback.to_owned(),
        };
        let mut text = template.to_owned();
        for (key, value) in args {
            text = text.replace(&format!("{{{key}}}"), value);
        }
        text
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("net", "docview", "docview")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;

    let config = ViewerConfig::load_default().unwrap_or_else(|err| {
        warn!(error = %err, "failed to load config; using defaults");
        ViewerConfig::default()
    });

    let manifest = Arc::new(DocumentManifest::load(&args.manifest)?);
    let surface = Arc::new(ShellSurface::default());
    let events = Arc::new(EventLog::new());
    let links = LinkService::new(surface)
        .with_document(manifest.clone())
        .with_event_sink(events.clone())
        .with_config(&config);

    if let Some(query) = &args.query {
        let params = parse_query_string(query);
        for (key, value) in &params {
            println!("query {key} = {value}");
        }
        if let Some(page) = params.get("page").and_then(|value| value.parse().ok()) {
            links.go_to_page(page);
        }
        if let Some(name) = params.get("dest") {
            links.go_to_destination(name);
        }
    }
    if let Some(page) = args.page {
        links.go_to_page(page);
    }
    if let Some(name) = &args.dest {
        links.go_to_destination(name);
    }

    let tracker = ViewportTracker::with_config(&config);
    tracker.define_container(
        CONTAINER,
        Rect::new(
            0.0,
            args.viewport_top,
            manifest.page_width,
            args.viewport_height.max(1.0),
        ),
    );
    for page in 1..=manifest.page_count {
        let y = (page as f32 - 1.0) * (manifest.page_height + PAGE_GAP);
        tracker.set_page_bounds(
            CONTAINER,
            page,
            Rect::new(0.0, y, manifest.page_width, manifest.page_height),
        );
    }

    let visible = tracker.visible_pages(CONTAINER, manifest.as_ref());
    println!("visible pages: {visible:?}");

    let current = links.current_page_number();
    let localizer = StaticLocalizer;
    let mut status_args = HashMap::new();
    status_args.insert("page".to_owned(), current.to_string());
    status_args.insert("total".to_owned(), manifest.page_count.to_string());
    let status = localizer
        .get("page_status", &status_args, "no page displayed")
        .await;
    if current > 0 {
        println!("{status}");
    } else {
        println!("no page displayed");
    }

    if current > 0 {
        let loading = tracker.show_loading(CONTAINER);
        let dispatcher = RenderDispatcher::new(Arc::new(BlankRenderer {
            page_width: manifest.page_width,
            page_height: manifest.page_height,
        }));
        let outcome = dispatcher
            .render_page(manifest.as_ref(), current as usize, args.scale, args.dpr)
            .await?;
        tracker.hide_loading(loading, CONTAINER);

        if let RenderOutcome::Committed(image) = outcome {
            println!("rendered page {current}: {}x{}", image.width, image.height);
            if let Some(filename) = &args.save_render {
                let downloads = FileDownloadManager {
                    root: std::env::current_dir()?,
                };
                downloads.download_data(&image.pixels, filename, "application/octet-stream")?;
                println!("wrote {filename}");
            }
        }
    }

    for event in events.take() {
        debug!(?event, "viewer event");
    }

    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "docview.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
