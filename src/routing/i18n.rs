//! Locale detection and path localization.

use isrgate_manifest::I18nConfig;

use super::request::InternalRequest;

pub const LOCALE_COOKIE: &str = "NEXT_LOCALE";

#[derive(Debug, Clone, Default)]
pub struct LocaleResolver {
    i18n: Option<I18nConfig>,
}

impl LocaleResolver {
    pub fn new(i18n: Option<I18nConfig>) -> Self {
        Self { i18n }
    }

    pub fn is_enabled(&self) -> bool {
        self.i18n.is_some()
    }

    pub fn locales(&self) -> &[String] {
        self.i18n
            .as_ref()
            .map(|i18n| i18n.locales.as_slice())
            .unwrap_or_default()
    }

    pub fn default_locale(&self) -> Option<&str> {
        self.i18n.as_ref().map(|i18n| i18n.default_locale.as_str())
    }

    /// The configured locale named by the first path segment, if any.
    pub fn path_locale(&self, path: &str) -> Option<&str> {
        let segment = path.split('/').nth(1)?;
        self.find_locale(segment)
    }

    pub fn is_localized_path(&self, path: &str) -> bool {
        self.path_locale(path).is_some()
    }

    /// Locale for a request whose path carries no locale prefix.
    pub fn detect_locale(&self, request: &InternalRequest) -> Option<String> {
        let i18n = self.i18n.as_ref()?;
        if !i18n.detection_enabled() {
            return Some(i18n.default_locale.clone());
        }

        let detected = self
            .domain_locale(request.host())
            .or_else(|| {
                request
                    .cookies
                    .get(LOCALE_COOKIE)
                    .and_then(|cookie| self.find_locale(cookie))
            })
            .or_else(|| {
                request
                    .header("accept-language")
                    .and_then(|header| self.negotiate(header))
            })
            .unwrap_or(i18n.default_locale.as_str());
        Some(detected.to_string())
    }

    /// Prefix the request path with its locale. A locale prefix already on
    /// the path is rewritten to its configured spelling.
    pub fn localize(&self, request: &InternalRequest) -> String {
        if let Some(locale) = self.path_locale(&request.raw_path) {
            let rest = request.raw_path[1..]
                .find('/')
                .map_or("", |at| &request.raw_path[at + 1..]);
            return format!("/{locale}{rest}");
        }
        match self.detect_locale(request) {
            Some(locale) => format!("/{locale}{}", request.raw_path),
            None => request.raw_path.clone(),
        }
    }

    fn find_locale(&self, candidate: &str) -> Option<&str> {
        self.locales()
            .iter()
            .find(|locale| locale.eq_ignore_ascii_case(candidate))
            .map(String::as_str)
    }

    fn domain_locale(&self, host: &str) -> Option<&str> {
        let i18n = self.i18n.as_ref()?;
        let hostname = strip_port(host);
        if hostname.is_empty() {
            return None;
        }
        i18n.domains
            .iter()
            .find(|domain| strip_port(&domain.domain).eq_ignore_ascii_case(hostname))
            .map(|domain| domain.default_locale.as_str())
    }

    fn negotiate(&self, header: &str) -> Option<&str> {
        for tag in preferred_languages(header) {
            if let Some(exact) = self.find_locale(&tag) {
                return Some(exact);
            }
            let primary = primary_subtag(&tag);
            if let Some(partial) = self
                .locales()
                .iter()
                .find(|locale| primary_subtag(locale).eq_ignore_ascii_case(primary))
            {
                return Some(partial);
            }
        }
        None
    }
}

fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

fn primary_subtag(tag: &str) -> &str {
    tag.split('-').next().unwrap_or(tag)
}

/// Language tags from an `Accept-Language` header ordered by quality.
/// Ties keep header order; `*` and `q=0` entries are dropped.
fn preferred_languages(header: &str) -> Vec<String> {
    let mut entries: Vec<(String, f32)> = header
        .split(',')
        .filter_map(|entry| {
            let mut parts = entry.split(';');
            let tag = parts.next()?.trim();
            if tag.is_empty() || tag == "*" {
                return None;
            }
            let quality = parts
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|q| q.trim().parse::<f32>().ok())
                .unwrap_or(1.0);
            (quality > 0.0).then(|| (tag.to_string(), quality))
        })
        .collect();
    entries.sort_by(|a, b| b.1.total_cmp(&a.1));
    entries.into_iter().map(|(tag, _)| tag).collect()
}
