//! 目录索引页解析
//!
//! 只提取 `<a href>` 链接，不做完整的 HTML 解析。

use super::RemoteEntry;
use regex::Regex;
use reqwest::Url;
use std::collections::HashSet;
use std::sync::OnceLock;
use tracing::trace;

fn anchor_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?is)<a\s[^>]*?href\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
            .expect("anchor regex is valid")
    })
}

/// 是否为需要跳过的链接：查询串、片段、上级目录、绝对路径等
fn should_skip_href(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    href.is_empty()
        || href.starts_with('?')
        || href.starts_with('#')
        || href.starts_with('/')
        || href == ".."
        || href.starts_with("../")
        || lower.starts_with("mailto:")
        || lower.starts_with("javascript:")
}

fn unescape_entities(href: &str) -> String {
    href.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

/// 从目录页 HTML 中提取子条目
///
/// 以 `/` 结尾的链接视为目录，其余为文件。同一页面中重复的链接只保留第一次出现。
pub fn parse_listing(html: &str, base: &Url) -> Vec<RemoteEntry> {
    let mut seen = HashSet::new();
    let mut entries = Vec::new();

    for caps in anchor_regex().captures_iter(html) {
        let raw = caps
            .get(1)
            .or_else(|| caps.get(2))
            .or_else(|| caps.get(3))
            .map(|m| m.as_str().trim())
            .unwrap_or_default();
        let href = unescape_entities(raw);

        if should_skip_href(&href) {
            trace!("跳过链接: {}", href);
            continue;
        }

        let mut url = match base.join(&href) {
            Ok(u) => u,
            Err(e) => {
                trace!("无法解析链接 {}: {}", href, e);
                continue;
            }
        };
        url.set_query(None);
        url.set_fragment(None);

        // 指向其他站点的链接不属于这棵树
        if url.scheme() != base.scheme() || url.host_str() != base.host_str() {
            trace!("跳过外部链接: {}", url);
            continue;
        }

        let is_dir = url.path().ends_with('/');
        let name = url
            .path()
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        if name.is_empty() {
            continue;
        }

        if seen.insert(url.as_str().to_string()) {
            entries.push(RemoteEntry { name, is_dir, url });
        }
    }

    entries
}
