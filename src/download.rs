//! Instagram media download through a third-party download site.
//!
//! The site is driven over plain HTTP: its submission form is located with
//! CSS selectors, the Instagram URL is posted to it and media links are
//! pulled out of whatever comes back.

use crate::utils::sanitize_filename;
use anyhow::{Context, anyhow, bail};
use chrono::Local;
use rand::Rng;
use rand::seq::SliceRandom;
use regex::Regex;
use reqwest::Url;
use reqwest::header::{CONTENT_DISPOSITION, CONTENT_TYPE, REFERER, USER_AGENT};
use scraper::{Html, Selector};
use serde::Serialize;
use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SITE: &str = "https://snapinsta.to/ru";
const BROWSER_UA: &str =
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const MAX_ATTEMPTS: u32 = 5;
const RETRY_ROUNDS: u32 = 3;
const RETRY_PAUSE: Duration = Duration::from_secs(10);
/// Without proxies only a handful of failures are worth another round.
const RETRY_WITHOUT_PROXIES: usize = 5;

static MEDIA_LINKS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"https://(?:dl|i)\.snapcdn\.app/(?:get|photo)\?token=[^"'<>\s\\]+"#,
        r#"https://scontent[^"'<>\s\\]+\.(?:mp4|jpg|webp|png)[^"'<>\s\\]*"#,
        r#"href=["']([^"']*(?:snapcdn|scontent)[^"']*)["']"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("media link pattern"))
    .collect()
});

static POST_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"href="(?:https?://(?:www\.)?instagram\.com)?(/(?:[A-Za-z0-9_.]+/)?(?:reels?|p|tv)/[A-Za-z0-9_-]+)"#)
        .expect("post link pattern")
});

static SHORTCODE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/(?:reels?|p|tv)/([A-Za-z0-9_-]+)").expect("shortcode pattern"));

static DISPOSITION_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"filename[*]?=["']?(?:(?i:utf-8)'')?([^"';\n]+)"#).expect("disposition pattern")
});

/// Undoes HTML entity and JSON string escaping around links.
fn unescape(raw: &str) -> String {
    raw.replace("\\/", "/")
        .replace("\\u0026", "&")
        .replace("&amp;", "&")
        .replace("&#038;", "&")
        .replace("&quot;", "\"")
}

/// Unique media links in page order.
pub fn extract_media_links(content: &str) -> Vec<String> {
    let content = unescape(content);
    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for re in MEDIA_LINKS.iter() {
        for caps in re.captures_iter(&content) {
            let m = caps.get(1).or_else(|| caps.get(0));
            let Some(m) = m else { continue };
            let link = m.as_str().trim().to_string();
            if link.starts_with("http") && seen.insert(link.clone()) {
                links.push(link);
            }
        }
    }
    links
}

/// Post and reel links of a saved Instagram page, as absolute URLs in page
/// order. Query strings are dropped.
pub fn extract_instagram_urls(html: &str) -> Vec<String> {
    let html = unescape(html);
    let mut seen = HashSet::new();
    POST_LINK
        .captures_iter(&html)
        .filter_map(|c| c.get(1))
        .map(|m| format!("https://www.instagram.com{}/", m.as_str()))
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

pub fn shortcode(url: &str) -> Option<&str> {
    SHORTCODE.captures(url).and_then(|c| c.get(1)).map(|m| m.as_str())
}

pub fn is_instagram_url(url: &str) -> bool {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .is_some_and(|host| host == "instagram.com" || host.ends_with(".instagram.com"))
}

/// Video links when there are any, otherwise the first link.
pub fn pick_downloads(links: &[String]) -> Vec<String> {
    let videos: Vec<String> = links
        .iter()
        .filter(|l| l.contains("dl.snapcdn") || l.to_lowercase().contains(".mp4"))
        .cloned()
        .collect();
    if videos.is_empty() {
        links.iter().take(1).cloned().collect()
    } else {
        videos
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SiteForm {
    pub action: Url,
    pub method: String,
    pub url_field: String,
    pub fields: Vec<(String, String)>,
}

fn selector(css: &str) -> anyhow::Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow!("{:?}", e))
}

/// Finds the form that takes the Instagram URL.
pub fn find_form(html: &str, page_url: &Url) -> anyhow::Result<Option<SiteForm>> {
    let document = Html::parse_document(html);
    let form_sel = selector("form")?;
    let input_sel = selector("input")?;
    let url_input_sel = selector(r#"input[name="url"], input#url, input[type="text"], input[type="url"]"#)?;

    for form in document.select(&form_sel) {
        let Some(url_input) = form.select(&url_input_sel).next() else {
            continue;
        };
        let url_field = url_input.value().attr("name").unwrap_or("url").to_string();
        let action = match form.value().attr("action").filter(|a| !a.trim().is_empty()) {
            Some(a) => page_url.join(a).context("Failed to resolve form action")?,
            None => page_url.clone(),
        };
        let method = form.value().attr("method").unwrap_or("post").to_uppercase();
        let fields = form
            .select(&input_sel)
            .filter_map(|input| {
                let name = input.value().attr("name")?;
                if name == url_field {
                    return None;
                }
                Some((name.to_string(), input.value().attr("value").unwrap_or("").to_string()))
            })
            .collect();
        return Ok(Some(SiteForm { action, method, url_field, fields }));
    }
    Ok(None)
}

fn hash_name(url: &str) -> String {
    let mut hasher = DefaultHasher::new();
    url.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// File name from `Content-Disposition`, else a hash of the URL, with the
/// extension fixed up from the content type.
pub fn file_name_for(url: &str, disposition: Option<&str>, content_type: Option<&str>) -> String {
    let mut name = disposition
        .and_then(|cd| DISPOSITION_NAME.captures(cd))
        .and_then(|c| c.get(1))
        .map(|m| {
            let raw = m.as_str().trim();
            urlencoding::decode(raw).map(|s| s.into_owned()).unwrap_or_else(|_| raw.to_string())
        })
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| hash_name(url));

    let ct = content_type.unwrap_or("").to_lowercase();
    let lower = name.to_lowercase();
    if ct.contains("video") && !lower.ends_with(".mp4") {
        name.push_str(".mp4");
    } else if ct.contains("image") && ![".jpg", ".jpeg", ".webp", ".png"].iter().any(|e| lower.ends_with(e)) {
        name.push_str(".jpg");
    }
    sanitize_filename(&name)
}

/// `host:port` lines, with scheme prefixes removed.
pub fn parse_proxies(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .map(|line| {
            ["socks5://", "socks5h://", "http://", "https://"]
                .iter()
                .fold(line, |l, prefix| l.strip_prefix(prefix).unwrap_or(l))
        })
        .filter(|l| !l.starts_with('#') && l.contains(':'))
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Default)]
pub struct ProxyPool {
    proxies: Vec<String>,
    failed: HashSet<String>,
}

impl ProxyPool {
    pub fn new(proxies: Vec<String>) -> Self {
        ProxyPool { proxies, failed: HashSet::new() }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read proxy file {}", path.display()))?;
        let proxies = parse_proxies(&text);
        info!("Loaded {} proxies", proxies.len());
        Ok(ProxyPool::new(proxies))
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Random proxy that has not failed yet; once all have failed the pool
    /// starts over.
    pub fn pick(&mut self) -> Option<String> {
        let mut available: Vec<&String> = self.proxies.iter().filter(|p| !self.failed.contains(*p)).collect();
        if available.is_empty() {
            self.failed.clear();
            available = self.proxies.iter().collect();
        }
        available.choose(&mut rand::thread_rng()).map(|p| p.to_string())
    }

    pub fn mark_failed(&mut self, proxy: &str) {
        self.failed.insert(proxy.to_string());
    }
}

/// URLs that were already downloaded, persisted as a JSON array.
#[derive(Debug)]
pub struct DownloadHistory {
    path: PathBuf,
    urls: HashSet<String>,
}

impl DownloadHistory {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let urls = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let list: Vec<String> = serde_json::from_str(&data)
                .with_context(|| format!("Invalid history file {}", path.display()))?;
            list.into_iter().collect()
        } else {
            HashSet::new()
        };
        Ok(DownloadHistory { path: path.to_path_buf(), urls })
    }

    pub fn contains(&self, url: &str) -> bool {
        self.urls.contains(url.trim())
    }

    pub fn record(&mut self, url: &str) -> anyhow::Result<()> {
        self.urls.insert(url.trim().to_string());
        self.save()
    }

    fn save(&self) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut list: Vec<&String> = self.urls.iter().collect();
        list.sort();
        std::fs::write(&self.path, serde_json::to_string_pretty(&list)?)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct DownloadResult {
    pub url: String,
    pub files: Vec<PathBuf>,
    pub error: Option<String>,
}

impl DownloadResult {
    pub fn succeeded(&self) -> bool {
        !self.files.is_empty()
    }
}

/// True when there were URLs to fetch and none of them produced a file.
pub fn all_failed(results: &[DownloadResult]) -> bool {
    !results.is_empty() && !results.iter().any(DownloadResult::succeeded)
}

fn failed_urls(results: &[DownloadResult]) -> Vec<String> {
    results.iter().filter(|r| !r.succeeded()).map(|r| r.url.clone()).collect()
}

/// Replaces the earlier result of every retried URL.
fn merge_retried(results: &mut [DownloadResult], retried: Vec<DownloadResult>) {
    for r in retried {
        if let Some(slot) = results.iter_mut().find(|old| old.url == r.url) {
            *slot = r;
        }
    }
}

fn retry_workers(workers: usize) -> usize {
    (workers / 2).max(1)
}

#[derive(Debug, Serialize)]
struct ManifestEntry<'a> {
    url: &'a str,
    shortcode: Option<&'a str>,
    files: &'a [PathBuf],
    status: &'a str,
}

/// Writes `manifest_<stamp>.json` into `dir`: one entry per URL with its
/// shortcode, saved files and status.
pub fn write_manifest(dir: &Path, results: &[DownloadResult], stamp: &str) -> anyhow::Result<PathBuf> {
    let entries: Vec<ManifestEntry> = results
        .iter()
        .map(|r| ManifestEntry {
            url: &r.url,
            shortcode: shortcode(&r.url),
            files: &r.files,
            status: if r.succeeded() { "OK" } else { r.error.as_deref().unwrap_or("Error") },
        })
        .collect();
    let path = dir.join(format!("manifest_{}.json", stamp));
    std::fs::write(&path, serde_json::to_string_pretty(&entries)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Body of a download, chunk by chunk.
trait ChunkSource {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<u8>>>;
}

impl ChunkSource for reqwest::Response {
    async fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.chunk().await?.map(|b| b.to_vec()))
    }
}

async fn write_body(body: &mut impl ChunkSource, path: &Path) -> anyhow::Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = body.next_chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

/// Streams `body` into `path`. An interrupted transfer leaves no file behind.
async fn save_body(body: &mut impl ChunkSource, path: &Path) -> anyhow::Result<u64> {
    match write_body(body, path).await {
        Ok(written) => Ok(written),
        Err(e) => {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!("Removed partial file {}", path.display()),
                Err(rm) if rm.kind() == ErrorKind::NotFound => {}
                Err(rm) => warn!("Could not remove partial file {}: {}", path.display(), rm),
            }
            Err(e)
        }
    }
}

pub struct Downloader {
    site: Url,
    output_dir: PathBuf,
    workers: usize,
    proxies: Mutex<ProxyPool>,
    history: Mutex<DownloadHistory>,
}

impl Downloader {
    pub fn new(site: &str, output_dir: &Path, workers: usize, proxies: ProxyPool, history: DownloadHistory) -> anyhow::Result<Self> {
        Ok(Downloader {
            site: Url::parse(site).with_context(|| format!("Invalid site URL {}", site))?,
            output_dir: output_dir.to_path_buf(),
            workers: workers.max(1),
            proxies: Mutex::new(proxies),
            history: Mutex::new(history),
        })
    }

    fn client(&self, proxy: Option<&str>) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .user_agent(BROWSER_UA)
            .timeout(Duration::from_secs(120));
        if let Some(p) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(format!("socks5h://{}", p))?);
        }
        Ok(builder.build()?)
    }

    fn pick_proxy(&self) -> Option<String> {
        self.proxies.lock().ok()?.pick()
    }

    fn mark_failed(&self, proxy: &Option<String>) {
        if let (Some(p), Ok(mut pool)) = (proxy, self.proxies.lock()) {
            pool.mark_failed(p);
        }
    }

    fn has_proxies(&self) -> bool {
        self.proxies.lock().map(|p| !p.is_empty()).unwrap_or(false)
    }

    fn already_downloaded(&self, url: &str) -> bool {
        self.history.lock().map(|h| h.contains(url)).unwrap_or(false)
    }

    async fn media_links(&self, client: &reqwest::Client, instagram_url: &str) -> anyhow::Result<Vec<String>> {
        let page = client.get(self.site.clone()).send().await?.error_for_status()?.text().await?;
        let form = find_form(&page, &self.site)?
            .ok_or_else(|| anyhow!("No download form found on {}", self.site))?;
        debug!("Submitting to {} ({})", form.action, form.method);

        let mut fields = form.fields.clone();
        fields.push((form.url_field.clone(), instagram_url.to_string()));
        let request = if form.method == "GET" {
            client.get(form.action.clone()).query(&fields)
        } else {
            client.post(form.action.clone()).form(&fields)
        };
        let body = request
            .header(REFERER, self.site.as_str())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(extract_media_links(&body))
    }

    async fn download_file(&self, client: &reqwest::Client, url: &str) -> anyhow::Result<(PathBuf, f64)> {
        let mut resp = client
            .get(url)
            .header(USER_AGENT, "Mozilla/5.0")
            .header(REFERER, self.site.origin().ascii_serialization())
            .send()
            .await?
            .error_for_status()?;
        let headers = resp.headers();
        let disposition = headers.get(CONTENT_DISPOSITION).and_then(|v| v.to_str().ok());
        let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
        let name = file_name_for(url, disposition, content_type);
        let path = self.output_dir.join(name);

        let written = save_body(&mut resp, &path).await?;
        Ok((path, written as f64 / (1024.0 * 1024.0)))
    }

    async fn process(&self, instagram_url: String, index: usize, total: usize) -> DownloadResult {
        let prefix = format!("[{}/{}]", index + 1, total);
        let mut result = DownloadResult { url: instagram_url.clone(), ..Default::default() };
        let mut proxy = self.pick_proxy();

        for attempt in 0..MAX_ATTEMPTS {
            info!("{} Processing: {}{}", prefix, instagram_url, if proxy.is_some() { " (proxy)" } else { "" });
            let client = match self.client(proxy.as_deref()) {
                Ok(c) => c,
                Err(e) => {
                    result.error = Some(format!("{:#}", e));
                    return result;
                }
            };

            let links = match self.media_links(&client, &instagram_url).await {
                Ok(links) => links,
                Err(e) => {
                    warn!("{} Error: {:#}", prefix, e);
                    if proxy.is_some() && attempt + 1 < MAX_ATTEMPTS {
                        self.mark_failed(&proxy);
                        proxy = self.pick_proxy();
                        continue;
                    }
                    result.error = Some(format!("{:#}", e));
                    return result;
                }
            };

            if links.is_empty() {
                if attempt + 1 < MAX_ATTEMPTS {
                    let wait = (attempt as f64 + 1.0) * 5.0 + rand::thread_rng().gen_range(0.0..3.0);
                    warn!("{} No links (rate limited?), waiting {:.0}s", prefix, wait);
                    sleep(Duration::from_secs_f64(wait)).await;
                    if proxy.is_some() {
                        self.mark_failed(&proxy);
                        proxy = self.pick_proxy();
                    }
                    continue;
                }
                error!("{} No download links found", prefix);
                result.error = Some("No download links found".to_string());
                return result;
            }

            for link in pick_downloads(&links) {
                match self.download_file(&client, &link).await {
                    Ok((path, mb)) => {
                        info!("{} Saved: {} ({:.2} MB)", prefix, path.display(), mb);
                        result.files.push(path);
                    }
                    Err(e) => warn!("{} Download error: {:#}", prefix, e),
                }
            }
            break;
        }

        if !result.files.is_empty() {
            if let Ok(mut history) = self.history.lock() {
                if let Err(e) = history.record(&instagram_url) {
                    warn!("Could not update download history: {:#}", e);
                }
            }
        } else if result.error.is_none() {
            result.error = Some("All downloads failed".to_string());
        }
        result
    }

    /// Downloads every URL with at most `workers` in flight, starting them
    /// a couple of seconds apart. Failed URLs get up to three more rounds with
    /// half the workers, and a JSON manifest of the run is left in the output
    /// directory.
    pub async fn download_all(self: Arc<Self>, urls: Vec<String>) -> anyhow::Result<Vec<DownloadResult>> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let pending: Vec<String> = urls
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .filter(|u| {
                let done = self.already_downloaded(u);
                if done {
                    info!("Skipping already downloaded {}", u);
                }
                !done
            })
            .collect();
        if pending.is_empty() {
            info!("Nothing to download");
            return Ok(Vec::new());
        }

        info!("Downloading {} URLs ({} workers)", pending.len(), self.workers);
        let mut results = Arc::clone(&self).run_batch(pending, self.workers).await?;
        info!(
            "First pass: {}/{} URLs",
            results.iter().filter(|r| r.succeeded()).count(),
            results.len()
        );
        Arc::clone(&self).retry_failed(&mut results).await?;

        let ok = results.iter().filter(|r| r.succeeded()).count();
        let files: usize = results.iter().map(|r| r.files.len()).sum();
        info!("Done: {}/{} URLs, {} files", ok, results.len(), files);
        for r in results.iter().filter(|r| !r.succeeded()) {
            warn!("Failed: {} ({})", r.url, r.error.as_deref().unwrap_or("unknown error"));
        }
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        match write_manifest(&self.output_dir, &results, &stamp) {
            Ok(path) => info!("Manifest: {}", path.display()),
            Err(e) => warn!("Could not write manifest: {:#}", e),
        }
        Ok(results)
    }

    async fn run_batch(self: Arc<Self>, urls: Vec<String>, workers: usize) -> anyhow::Result<Vec<DownloadResult>> {
        let total = urls.len();
        let semaphore = Arc::new(Semaphore::new(workers));
        let mut set = JoinSet::new();
        for (index, url) in urls.into_iter().enumerate() {
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            set.spawn(async move {
                let stagger = index as f64 * 2.0 + rand::thread_rng().gen_range(0.0..2.0);
                sleep(Duration::from_secs_f64(stagger)).await;
                let _permit = semaphore.acquire_owned().await;
                (index, this.process(url, index, total).await)
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = set.join_next().await {
            results.push(joined?);
        }
        results.sort_by_key(|(i, _)| *i);
        Ok(results.into_iter().map(|(_, r)| r).collect())
    }

    async fn retry_failed(self: Arc<Self>, results: &mut [DownloadResult]) -> anyhow::Result<()> {
        let mut failed = failed_urls(results);
        if failed.is_empty() {
            return Ok(());
        }
        if failed.len() > RETRY_WITHOUT_PROXIES && !self.has_proxies() {
            warn!("{} URLs failed; configure proxies to retry them", failed.len());
            return Ok(());
        }
        let workers = retry_workers(self.workers);
        for round in 1..=RETRY_ROUNDS {
            info!("Retry #{}: {} URLs ({} workers)", round, failed.len(), workers);
            let retried = Arc::clone(&self).run_batch(failed.clone(), workers).await?;
            merge_retried(results, retried);
            let still_failed = failed_urls(results);
            info!("Retry #{}: {}/{} recovered", round, failed.len() - still_failed.len(), failed.len());
            failed = still_failed;
            if failed.is_empty() {
                break;
            }
            if round < RETRY_ROUNDS {
                sleep(RETRY_PAUSE).await;
            }
        }
        Ok(())
    }
}

/// Instagram URLs from the command line, an optional list file (`#` starts a
/// comment) and an optional saved HTML page, deduplicated in order. Anything
/// that is not an instagram.com link is skipped with a warning.
pub fn collect_urls(args: &[String], file: Option<&Path>, html: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let mut raw: Vec<String> = args.to_vec();
    if let Some(path) = file {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read URL list {}", path.display()))?;
        raw.extend(
            text.lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(str::to_string),
        );
    }
    if let Some(path) = html {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read HTML page {}", path.display()))?;
        let found = extract_instagram_urls(&text);
        info!("Found {} post links in {}", found.len(), path.display());
        raw.extend(found);
    }

    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for url in raw {
        let url = url.trim();
        if url.is_empty() {
            continue;
        }
        if !is_instagram_url(url) {
            warn!("Skipping non-Instagram URL {}", url);
            continue;
        }
        if seen.insert(url.to_string()) {
            urls.push(url.to_string());
        } else {
            debug!("Duplicate URL {}", url);
        }
    }
    if urls.is_empty() {
        bail!("No Instagram URLs given");
    }
    Ok(urls)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_and_unescapes_links() {
        let html = r#"
            <a href="https://dl.snapcdn.app/get?token=abc&amp;x=1">Download</a>
            <img src="https://scontent.cdninstagram.com/v/t51/123.jpg?stp=1">
            <a href="https://dl.snapcdn.app/get?token=abc&amp;x=1">dup</a>
        "#;
        let links = extract_media_links(html);
        assert_eq!(links[0], "https://dl.snapcdn.app/get?token=abc&x=1");
        assert!(links.iter().any(|l| l.starts_with("https://scontent.cdninstagram.com/v/t51/123.jpg")));
        assert_eq!(links.iter().filter(|l| l.contains("token=abc")).count(), 1);
    }

    #[test]
    fn extracts_links_from_json_escaped_html() {
        let body = r#"{"data":"<a href=\"https:\/\/dl.snapcdn.app\/get?token=zz\">x<\/a>"}"#;
        let links = extract_media_links(body);
        assert_eq!(links, vec!["https://dl.snapcdn.app/get?token=zz".to_string()]);
    }

    #[test]
    fn prefers_video_links() {
        let links = vec![
            "https://i.snapcdn.app/photo?token=p".to_string(),
            "https://dl.snapcdn.app/get?token=v".to_string(),
        ];
        assert_eq!(pick_downloads(&links), vec!["https://dl.snapcdn.app/get?token=v".to_string()]);
        let photos = vec!["https://i.snapcdn.app/photo?token=a".to_string(), "https://i.snapcdn.app/photo?token=b".to_string()];
        assert_eq!(pick_downloads(&photos).len(), 1);
    }

    #[test]
    fn finds_form_and_hidden_fields() {
        let html = r#"
            <form id="search" action="/api/ajaxSearch" method="post">
                <input type="hidden" name="token" value="t0k">
                <input type="text" name="q" placeholder="Paste link">
                <button type="submit">Download</button>
            </form>"#;
        let base = Url::parse("https://snapinsta.to/ru").unwrap();
        let form = find_form(html, &base).unwrap().unwrap();
        assert_eq!(form.action.as_str(), "https://snapinsta.to/api/ajaxSearch");
        assert_eq!(form.method, "POST");
        assert_eq!(form.url_field, "q");
        assert_eq!(form.fields, vec![("token".to_string(), "t0k".to_string())]);
    }

    #[test]
    fn page_without_form() {
        let base = Url::parse("https://snapinsta.to/ru").unwrap();
        assert!(find_form("<p>maintenance</p>", &base).unwrap().is_none());
    }

    #[test]
    fn file_names() {
        assert_eq!(
            file_name_for("u", Some(r#"attachment; filename="reel 1.mp4""#), Some("video/mp4")),
            "reel 1.mp4"
        );
        assert_eq!(
            file_name_for("u", Some("attachment; filename*=UTF-8''clip%3A2"), Some("video/mp4")),
            "clip_2.mp4"
        );
        let hashed = file_name_for("https://x/y", None, Some("image/jpeg"));
        assert!(hashed.ends_with(".jpg"));
        assert_eq!(hashed.len(), 16 + 4);
    }

    #[test]
    fn proxies_are_normalized() {
        let text = "socks5://1.2.3.4:1080\n# comment\n\nhttp://5.6.7.8:3128\nbad-line\n";
        assert_eq!(parse_proxies(text), vec!["1.2.3.4:1080", "5.6.7.8:3128"]);
    }

    #[test]
    fn proxy_pool_skips_failed_then_resets() {
        let mut pool = ProxyPool::new(vec!["a:1".into(), "b:2".into()]);
        pool.mark_failed("a:1");
        for _ in 0..10 {
            assert_eq!(pool.pick().as_deref(), Some("b:2"));
        }
        pool.mark_failed("b:2");
        assert!(pool.pick().is_some());
        assert!(ProxyPool::default().pick().is_none());
    }

    #[test]
    fn history_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config/downloaded.json");
        let mut history = DownloadHistory::load(&path).unwrap();
        assert!(!history.contains("https://instagram.com/reel/1"));
        history.record(" https://instagram.com/reel/1 ").unwrap();
        let reloaded = DownloadHistory::load(&path).unwrap();
        assert!(reloaded.contains("https://instagram.com/reel/1"));
    }

    #[test]
    fn urls_from_args_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let list = dir.path().join("urls.txt");
        std::fs::write(
            &list,
            "# reels\nhttps://www.instagram.com/reel/A/\n\nhttps://instagram.com/p/B/\n",
        )
        .unwrap();
        let urls = collect_urls(&["https://www.instagram.com/p/C/".to_string()], Some(&list), None).unwrap();
        assert_eq!(
            urls,
            vec!["https://www.instagram.com/p/C/", "https://www.instagram.com/reel/A/", "https://instagram.com/p/B/"]
        );
        assert!(collect_urls(&[], None, None).is_err());
    }

    #[test]
    fn collected_urls_are_deduplicated_and_filtered() {
        let args: Vec<String> = [
            "https://www.instagram.com/reel/A/",
            "https://example.com/video.mp4",
            " https://www.instagram.com/reel/A/ ",
            "not a url",
            "https://www.instagram.com/p/B/",
            "https://www.instagram.com/reel/A/",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let urls = collect_urls(&args, None, None).unwrap();
        assert_eq!(urls, vec!["https://www.instagram.com/reel/A/", "https://www.instagram.com/p/B/"]);
        assert!(collect_urls(&["https://example.com/x".to_string()], None, None).is_err());
    }

    #[test]
    fn post_links_come_from_saved_page() {
        let html = r#"
            <a href="/someone/reel/DAbc-12_x/?igsh=1">reel</a>
            <a href="/someone/p/Post1/">post</a>
            <a href="/someone/reel/DAbc-12_x/">same reel</a>
            <a href="https://www.instagram.com/p/Abs0lute/">absolute</a>
            <a href="/explore/tags/cats/">tag</a>
            <a href="/someone/">profile</a>
        "#;
        assert_eq!(
            extract_instagram_urls(html),
            vec![
                "https://www.instagram.com/someone/reel/DAbc-12_x/",
                "https://www.instagram.com/someone/p/Post1/",
                "https://www.instagram.com/p/Abs0lute/",
            ]
        );

        let dir = tempfile::tempdir().unwrap();
        let page = dir.path().join("saved.html");
        std::fs::write(&page, html).unwrap();
        let urls = collect_urls(&["https://www.instagram.com/p/Post1/".to_string()], None, Some(&page)).unwrap();
        assert_eq!(urls.len(), 4);
        assert_eq!(urls[0], "https://www.instagram.com/p/Post1/");
    }

    #[test]
    fn shortcodes_and_hosts() {
        assert_eq!(shortcode("https://www.instagram.com/someone/reel/DAbc/"), Some("DAbc"));
        assert_eq!(shortcode("https://www.instagram.com/p/XyZ_1/?igsh=2"), Some("XyZ_1"));
        assert_eq!(shortcode("https://www.instagram.com/someone/"), None);
        assert!(is_instagram_url("https://m.instagram.com/p/x/"));
        assert!(!is_instagram_url("https://notinstagram.com/p/x/"));
    }

    fn result(url: &str, ok: bool) -> DownloadResult {
        DownloadResult {
            url: url.to_string(),
            files: if ok { vec![PathBuf::from(format!("{}.mp4", url))] } else { Vec::new() },
            error: (!ok).then(|| "No download links found".to_string()),
        }
    }

    #[test]
    fn retried_results_replace_failures() {
        let mut results = vec![result("a", true), result("b", false), result("c", false)];
        assert_eq!(failed_urls(&results), vec!["b", "c"]);
        merge_retried(&mut results, vec![result("c", true), result("b", false)]);
        assert_eq!(failed_urls(&results), vec!["b"]);
        assert!(results[2].succeeded());
        assert_eq!(results.len(), 3);
    }

    #[test]
    fn retry_uses_half_the_workers() {
        assert_eq!(retry_workers(6), 3);
        assert_eq!(retry_workers(3), 1);
        assert_eq!(retry_workers(1), 1);
    }

    #[test]
    fn run_fails_only_when_nothing_was_saved() {
        assert!(!all_failed(&[]));
        assert!(all_failed(&[result("a", false), result("b", false)]));
        assert!(!all_failed(&[result("a", false), result("b", true)]));
    }

    #[test]
    fn manifest_lists_every_url() {
        let dir = tempfile::tempdir().unwrap();
        let results = vec![
            result("https://www.instagram.com/reel/AAA/", true),
            result("https://www.instagram.com/p/BBB/", false),
        ];
        let path = write_manifest(dir.path(), &results, "20260101_120000").unwrap();
        assert_eq!(path.file_name().unwrap(), "manifest_20260101_120000.json");
        let entries: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(entries[0]["shortcode"], "AAA");
        assert_eq!(entries[0]["status"], "OK");
        assert_eq!(entries[0]["files"].as_array().unwrap().len(), 1);
        assert_eq!(entries[1]["status"], "No download links found");
    }

    struct Chunks(Vec<anyhow::Result<Vec<u8>>>);

    impl ChunkSource for Chunks {
        async fn next_chunk(&mut self) -> anyhow::Result<Option<Vec<u8>>> {
            if self.0.is_empty() {
                return Ok(None);
            }
            self.0.remove(0).map(Some)
        }
    }

    #[tokio::test]
    async fn interrupted_download_leaves_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reel.mp4");
        let mut body = Chunks(vec![Ok(b"first".to_vec()), Err(anyhow!("connection reset"))]);
        assert!(save_body(&mut body, &path).await.is_err());
        assert!(!path.exists());

        let mut body = Chunks(vec![Ok(b"first".to_vec()), Ok(b"second".to_vec())]);
        assert_eq!(save_body(&mut body, &path).await.unwrap(), 11);
        assert_eq!(std::fs::read(&path).unwrap(), b"firstsecond");
    }
}
