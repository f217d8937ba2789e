//! Banner shown to clients that ask for an interactive shell.

use crate::auth::Identity;
use crate::error::BannerError;

pub const DEFAULT_BANNER: &str = "Welcome to gitgate {{ .Name }}\nYour public key id is {{ .Id }}\n";

/// Produces the bytes written to a `shell` channel before it is closed.
pub trait BannerRenderer: Send + Sync {
    fn render(&self, identity: &Identity) -> Result<Vec<u8>, BannerError>;
}

/// Renders `{{ .Field }}` placeholders from the identity.
///
/// Supported fields: `Name`, `Id`, `Fingerprint`, `Content`.
#[derive(Debug, Clone)]
pub struct TemplateBanner {
    template: String,
}

impl TemplateBanner {
    /// An absent or empty template falls back to [`DEFAULT_BANNER`].
    pub fn new(template: Option<&str>) -> Self {
        let template = match template {
            Some(t) if !t.is_empty() => t,
            _ => DEFAULT_BANNER,
        };
        Self {
            template: template.to_string(),
        }
    }
}

impl BannerRenderer for TemplateBanner {
    fn render(&self, identity: &Identity) -> Result<Vec<u8>, BannerError> {
        render_banner(&self.template, identity).map(String::into_bytes)
    }
}

pub fn render_banner(template: &str, identity: &Identity) -> Result<String, BannerError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    let mut offset = 0;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let inner_start = start + 2;
        let end = rest[inner_start..]
            .find("}}")
            .ok_or(BannerError::Unterminated(offset + start))?;
        let field = rest[inner_start..inner_start + end].trim();
        let value = match field.strip_prefix('.').map(str::trim) {
            Some("Name") => &identity.name,
            Some("Id") => &identity.id,
            Some("Fingerprint") => &identity.fingerprint,
            Some("Content") => &identity.content,
            _ => return Err(BannerError::UnknownField(field.to_string())),
        };
        out.push_str(value);

        let consumed = inner_start + end + 2;
        rest = &rest[consumed..];
        offset += consumed;
    }
    out.push_str(rest);

    Ok(out)
}
