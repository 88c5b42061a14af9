//! Portal page adapter: course title extraction and recursive tree discovery
//! over rendered HTML.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use csync_core::{sanitize_path_segment, DiscoveredItem, DownloadTask};
use csync_storage::PortalSession;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector: {0}")]
    Selector(String),
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Selector(e.to_string()))
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: &ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

fn has_class(element: &ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

/// Markers and thresholds for reading the portal's rendered pages.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub container_class: String,
    pub title_link_class: String,
    pub outer_container_class: String,
    /// Matched case-insensitively as substrings of an icon's alt text.
    pub folder_icon_alts: Vec<String>,
    pub file_command: String,
    pub view_command: String,
    pub content_ref_marker: String,
    /// Lower-case link texts that are navigation chrome, never folders.
    pub navigation_stoplist: Vec<String>,
    pub min_link_text_len: usize,
    pub max_depth: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            container_class: "il_ContainerListItem".to_string(),
            title_link_class: "il_ContainerItemTitle".to_string(),
            outer_container_class: "ilContainerListItemOuter".to_string(),
            folder_icon_alts: vec!["folder".to_string(), "ordner".to_string()],
            file_command: "cmd=sendfile".to_string(),
            view_command: "cmd=view".to_string(),
            content_ref_marker: "ref_id".to_string(),
            navigation_stoplist: ["home", "back", "up", "zurück", "startseite"]
                .into_iter()
                .map(String::from)
                .collect(),
            min_link_text_len: 2,
            max_depth: 32,
        }
    }
}

/// Everything a strategy may look at for one page.
pub struct PageContext<'a> {
    pub document: &'a Html,
    pub base_url: &'a Url,
    pub logical_path: &'a Path,
}

impl PageContext<'_> {
    fn item(&self, href: &str, raw_name: &str, is_folder: bool) -> Option<DiscoveredItem> {
        let name = sanitize_path_segment(raw_name);
        if name.is_empty() {
            debug!(href, "skipping entry without a usable name");
            return None;
        }
        let url = match self.base_url.join(href) {
            Ok(url) => url,
            Err(err) => {
                debug!(href, error = %err, "skipping entry with unresolvable link");
                return None;
            }
        };
        Some(DiscoveredItem {
            url: url.to_string(),
            logical_path: self.logical_path.to_path_buf(),
            name,
            is_folder,
        })
    }
}

/// One way of reading a page. `None` means "no opinion", so the next strategy runs.
pub trait PageStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(&self, page: &PageContext<'_>) -> Option<Vec<DiscoveredItem>>;
}

/// The portal's list-item containers, with a folder icon beside folder links.
pub struct ContainerListStrategy {
    config: DiscoveryConfig,
    containers: Selector,
    links: Selector,
    icons: Selector,
}

impl ContainerListStrategy {
    pub fn new(config: DiscoveryConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            config,
            containers: selector("div")?,
            links: selector("a[href]")?,
            icons: selector("img[alt]")?,
        })
    }

    fn shows_folder_icon(&self, scope: &ElementRef<'_>) -> bool {
        scope
            .select(&self.icons)
            .filter_map(|img| img.value().attr("alt"))
            .map(str::to_lowercase)
            .any(|alt| {
                self.config
                    .folder_icon_alts
                    .iter()
                    .any(|marker| alt.contains(&marker.to_lowercase()))
            })
    }

    fn outer_container<'a>(&self, container: &ElementRef<'a>) -> Option<ElementRef<'a>> {
        container
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "div" && has_class(el, &self.config.outer_container_class))
    }
}

impl PageStrategy for ContainerListStrategy {
    fn name(&self) -> &'static str {
        "container-list"
    }

    fn classify(&self, page: &PageContext<'_>) -> Option<Vec<DiscoveredItem>> {
        let containers = page
            .document
            .select(&self.containers)
            .filter(|div| has_class(div, &self.config.container_class))
            .collect::<Vec<_>>();
        if containers.is_empty() {
            return None;
        }

        let mut items = Vec::new();
        for container in containers {
            let Some(link) = container
                .select(&self.links)
                .find(|a| has_class(a, &self.config.title_link_class))
            else {
                continue;
            };
            let href = link.value().attr("href").unwrap_or_default();
            let scope = self.outer_container(&container).unwrap_or(container);
            let is_folder = self.shows_folder_icon(&scope);

            if is_folder || href.contains(&self.config.file_command) {
                items.extend(page.item(href, &element_text(&link), is_folder));
            }
        }
        Some(items)
    }
}

/// Last resort: classify every hyperlink by its command pattern.
pub struct LinkPatternStrategy {
    config: DiscoveryConfig,
    links: Selector,
}

impl LinkPatternStrategy {
    pub fn new(config: DiscoveryConfig) -> Result<Self, AdapterError> {
        Ok(Self {
            config,
            links: selector("a[href]")?,
        })
    }

    fn is_navigation(&self, text: &str) -> bool {
        let lower = text.to_lowercase();
        self.config.navigation_stoplist.iter().any(|s| *s == lower)
    }
}

impl PageStrategy for LinkPatternStrategy {
    fn name(&self) -> &'static str {
        "link-pattern"
    }

    fn classify(&self, page: &PageContext<'_>) -> Option<Vec<DiscoveredItem>> {
        let mut items = Vec::new();
        for link in page.document.select(&self.links) {
            let href = link.value().attr("href").unwrap_or_default();
            let Some(text) = text_or_none(element_text(&link)) else {
                continue;
            };
            if text.chars().count() < self.config.min_link_text_len {
                continue;
            }

            if href.contains(&self.config.file_command) {
                items.extend(page.item(href, &text, false));
            } else if href.contains(&self.config.view_command)
                && href.contains(&self.config.content_ref_marker)
                && !self.is_navigation(&text)
            {
                items.extend(page.item(href, &text, true));
            }
        }
        Some(items)
    }
}

/// Ordered chain of [`PageStrategy`]s; the first with an opinion wins.
pub struct PageClassifier {
    strategies: Vec<Box<dyn PageStrategy>>,
}

impl PageClassifier {
    pub fn new(strategies: Vec<Box<dyn PageStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn portal_default(config: &DiscoveryConfig) -> Result<Self, AdapterError> {
        Ok(Self::new(vec![
            Box::new(ContainerListStrategy::new(config.clone())?),
            Box::new(LinkPatternStrategy::new(config.clone())?),
        ]))
    }

    pub fn classify(&self, html: &str, base_url: &Url, logical_path: &Path) -> Vec<DiscoveredItem> {
        let document = Html::parse_document(html);
        let page = PageContext {
            document: &document,
            base_url,
            logical_path,
        };
        for strategy in &self.strategies {
            if let Some(items) = strategy.classify(&page) {
                debug!(strategy = strategy.name(), items = items.len(), "page classified");
                return items;
            }
        }
        Vec::new()
    }
}

enum Work {
    Visit {
        url: String,
        path: PathBuf,
        depth: usize,
    },
    Emit(DownloadTask),
}

/// Walks a course's page tree and turns every file leaf into a [`DownloadTask`].
pub struct TreeDiscoverer {
    config: DiscoveryConfig,
    classifier: PageClassifier,
}

impl TreeDiscoverer {
    pub fn new(config: DiscoveryConfig) -> Result<Self, AdapterError> {
        let classifier = PageClassifier::portal_default(&config)?;
        Ok(Self { config, classifier })
    }

    pub fn with_classifier(config: DiscoveryConfig, classifier: PageClassifier) -> Self {
        Self { config, classifier }
    }

    /// Pre-order walk from `root_url`. A page that cannot be fetched contributes
    /// nothing; its siblings are still visited.
    pub async fn discover(
        &self,
        root_url: &str,
        root_path: &Path,
        session: &dyn PortalSession,
        course_title: &str,
    ) -> Vec<DownloadTask> {
        let mut tasks = Vec::new();
        let mut visited = HashSet::from([root_url.to_string()]);
        let mut stack = vec![Work::Visit {
            url: root_url.to_string(),
            path: root_path.to_path_buf(),
            depth: 0,
        }];

        while let Some(work) = stack.pop() {
            let (url, path, depth) = match work {
                Work::Emit(task) => {
                    tasks.push(task);
                    continue;
                }
                Work::Visit { url, path, depth } => (url, path, depth),
            };

            info!(path = %path.display(), "scanning");
            let items = self
                .scan_page(&url, &path, session)
                .instrument(info_span!("discover_page", url = %url, depth))
                .await;

            // Reversed so the stack pops entries in page order.
            for item in items.into_iter().rev() {
                if item.is_folder {
                    if depth + 1 > self.config.max_depth {
                        warn!(url = %item.url, max_depth = self.config.max_depth, "folder too deep, not entering");
                        continue;
                    }
                    if !visited.insert(item.url.clone()) {
                        debug!(url = %item.url, "folder already visited");
                        continue;
                    }
                    stack.push(Work::Visit {
                        url: item.url,
                        path: item.logical_path.join(&item.name),
                        depth: depth + 1,
                    });
                } else {
                    stack.push(Work::Emit(DownloadTask {
                        url: item.url,
                        target_directory: item.logical_path,
                        suggested_name: item.name,
                        course_title: course_title.to_string(),
                    }));
                }
            }
        }

        info!(files = tasks.len(), "discovery complete");
        tasks
    }

    async fn scan_page(
        &self,
        url: &str,
        path: &Path,
        session: &dyn PortalSession,
    ) -> Vec<DiscoveredItem> {
        let page = match session.get_page(url).await {
            Ok(page) => page,
            Err(err) => {
                warn!(url, error = %err, "could not access page, skipping subtree");
                return Vec::new();
            }
        };
        let base = match Url::parse(&page.final_url).or_else(|_| Url::parse(url)) {
            Ok(base) => base,
            Err(err) => {
                warn!(url, error = %err, "page url is not absolute, skipping subtree");
                return Vec::new();
            }
        };
        self.classifier.classify(&page.body, &base, path)
    }
}

/// Best-effort course title from a course's root page, already sanitized.
pub fn extract_course_title(html: &str) -> Result<Option<String>, AdapterError> {
    let document = Html::parse_document(html);

    let heading = document
        .select(&selector("h1")?)
        .find_map(|h| text_or_none(element_text(&h)));
    if let Some(title) = heading.and_then(non_empty_sanitized) {
        return Ok(Some(title));
    }

    for tag in ["div", "span"] {
        let found = document
            .select(&selector(&format!("{tag}[class]"))?)
            .filter(|el| {
                el.value()
                    .classes()
                    .any(|c| looks_like_title_class(c, tag == "div"))
            })
            .find_map(|el| text_or_none(element_text(&el)));
        if let Some(title) = found.and_then(non_empty_sanitized) {
            return Ok(Some(title));
        }
    }

    let page_title = document
        .select(&selector("title")?)
        .next()
        .and_then(|t| text_or_none(element_text(&t)));
    Ok(page_title
        .map(|t| strip_portal_prefix(&t).to_string())
        .and_then(non_empty_sanitized))
}

fn non_empty_sanitized(text: String) -> Option<String> {
    let clean = sanitize_path_segment(&text);
    if clean.is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// `ilHeaderTitle`-style classes; `PageTitle` also counts for divs.
fn looks_like_title_class(class: &str, allow_page_title: bool) -> bool {
    let lower = class.to_ascii_lowercase();
    let il_title = lower
        .find("il")
        .is_some_and(|i| lower[i + 2..].contains("title"));
    il_title || (allow_page_title && lower.contains("pagetitle"))
}

/// `"Portal - Course Name"` -> `"Course Name"`.
fn strip_portal_prefix(title: &str) -> &str {
    match title.split_once(" - ") {
        Some((prefix, rest)) if !prefix.contains('-') && !rest.trim().is_empty() => rest.trim(),
        _ => title.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://portal.example/ilias.php?ref_id=100&cmd=view").unwrap()
    }

    fn classify(html: &str) -> Vec<DiscoveredItem> {
        PageClassifier::portal_default(&DiscoveryConfig::default())
            .unwrap()
            .classify(html, &base(), Path::new("/dl/Course"))
    }

    #[test]
    fn container_items_split_into_folders_and_files() {
        let html = r#"
            <div class="ilContainerListItemOuter">
              <img alt="Ordner" src="icon_fold.svg">
              <div class="il_ContainerListItem">
                <a class="il_ContainerItemTitle" href="ilias.php?ref_id=200&amp;cmd=view">Week 1</a>
              </div>
            </div>
            <div class="ilContainerListItemOuter">
              <img alt="Datei" src="icon_file.svg">
              <div class="il_ContainerListItem">
                <a class="il_ContainerItemTitle" href="ilias.php?ref_id=301&amp;cmd=sendfile">Syllabus</a>
              </div>
            </div>
            <div class="ilContainerListItemOuter">
              <img alt="Forum" src="icon_frm.svg">
              <div class="il_ContainerListItem">
                <a class="il_ContainerItemTitle" href="ilias.php?ref_id=400&amp;cmd=showThreads">Forum</a>
              </div>
            </div>"#;

        let items = classify(html);
        assert_eq!(items.len(), 2);
        assert!(items[0].is_folder);
        assert_eq!(items[0].name, "Week 1");
        assert_eq!(items[0].url, "https://portal.example/ilias.php?ref_id=200&cmd=view");
        assert!(!items[1].is_folder);
        assert_eq!(items[1].name, "Syllabus");
        assert_eq!(items[1].logical_path, PathBuf::from("/dl/Course"));
    }

    #[test]
    fn fallback_finds_single_file_link() {
        let html = r#"<html><body>
            <a href="ilias.php?ref_id=1&amp;cmd=frameset">Home</a>
            <a href="ilias.php?ref_id=55&amp;cmd=sendfile">Lecture01.pdf</a>
        </body></html>"#;

        let items = classify(html);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Lecture01.pdf");
        assert!(!items[0].is_folder);
    }

    #[test]
    fn fallback_skips_navigation_and_short_links() {
        let html = r#"
            <a href="ilias.php?ref_id=1&amp;cmd=view">Startseite</a>
            <a href="ilias.php?ref_id=2&amp;cmd=view">Zurück</a>
            <a href="ilias.php?ref_id=3&amp;cmd=view">X</a>
            <a href="ilias.php?ref_id=4&amp;cmd=view">   </a>
            <a href="ilias.php?cmd=view">No reference</a>
            <a href="ilias.php?ref_id=5&amp;cmd=view">Exercises</a>"#;

        let items = classify(html);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "Exercises");
        assert!(items[0].is_folder);
    }

    #[test]
    fn names_are_sanitized() {
        let html = r#"<a href="x?cmd=sendfile&amp;ref_id=9">Blatt 1: Lösung?</a>"#;
        assert_eq!(classify(html)[0].name, "Blatt 1 Lösung");
    }

    #[test]
    fn unrecognized_page_yields_nothing() {
        assert!(classify("<html><body><p>Nothing here</p></body></html>").is_empty());
    }

    struct Fixed;

    impl PageStrategy for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn classify(&self, page: &PageContext<'_>) -> Option<Vec<DiscoveredItem>> {
            page.item("only.pdf", "only.pdf", false).map(|item| vec![item])
        }
    }

    struct Silent;

    impl PageStrategy for Silent {
        fn name(&self) -> &'static str {
            "silent"
        }

        fn classify(&self, _page: &PageContext<'_>) -> Option<Vec<DiscoveredItem>> {
            None
        }
    }

    #[test]
    fn chain_falls_through_strategies_without_opinion() {
        let classifier = PageClassifier::new(vec![Box::new(Silent), Box::new(Fixed)]);
        let items = classifier.classify("<html></html>", &base(), Path::new("/dl"));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].url, "https://portal.example/only.pdf");
    }

    #[test]
    fn title_prefers_heading_then_classes_then_title_tag() {
        let h1 = "<html><head><title>Portal - Other</title></head><body><h1> Numerical Methods </h1></body></html>";
        assert_eq!(extract_course_title(h1).unwrap().as_deref(), Some("Numerical Methods"));

        let div = r#"<div class="ilHeaderTitle">Linear Algebra: Part 2</div>"#;
        assert_eq!(
            extract_course_title(div).unwrap().as_deref(),
            Some("Linear Algebra Part 2")
        );

        let title = "<html><head><title>StudOn - Analysis I</title></head><body></body></html>";
        assert_eq!(extract_course_title(title).unwrap().as_deref(), Some("Analysis I"));

        assert_eq!(extract_course_title("<p>nothing</p>").unwrap(), None);
    }

    #[test]
    fn title_class_heuristics() {
        assert!(looks_like_title_class("ilHeaderTitle", true));
        assert!(looks_like_title_class("il_PageTitle", false));
        assert!(looks_like_title_class("ilc_PageTitle", true));
        assert!(looks_like_title_class("PageTitle", true));
        assert!(!looks_like_title_class("PageTitle", false));
        assert!(!looks_like_title_class("navbar", true));
    }
}
