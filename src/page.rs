//! Landing page for a shared link.

use byte_unit::{Byte, UnitType};

use crate::store::Media;

const RESOLUTION_TAGS: [&str; 5] = ["2160p", "1080p", "720p", "480p", "360p"];

/// Everything the landing page shows about one object.
#[derive(Debug, Clone)]
pub struct ShowPage {
    pub display_name: String,
    pub size: String,
    pub download_link: String,
    /// `(intent, vlc)` links, only for video and audio.
    pub player_links: Option<(String, String)>,
}

impl ShowPage {
    pub fn new(base_url: &str, sequence: u64, media: &Media) -> Self {
        let download_link = download_link(base_url, sequence, &media.name);
        let player_links = media.kind.is_playable().then(|| {
            let mime = media.mime_type.as_deref().unwrap_or("video/*");
            (
                format!(
                    "intent:{download_link}#Intent;action=android.intent.action.VIEW;type={mime};end"
                ),
                format!("vlc://{download_link}"),
            )
        });
        Self {
            display_name: mask_filename(&media.name),
            size: readable_size(media.size),
            download_link,
            player_links,
        }
    }

    pub fn render(&self) -> String {
        let players = match &self.player_links {
            Some((intent, vlc)) => format!(
                r#"
    <p class="players">
      <a href="{}">Play in MX Player</a>
      <a href="{}">Play in VLC</a>
    </p>"#,
                escape_html(intent),
                escape_html(vlc)
            ),
            None => String::new(),
        };
        format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width, initial-scale=1">
  <title>{name}</title>
</head>
<body>
  <main>
    <h1>{name}</h1>
    <p class="size">{size}</p>
    <p><a class="download" href="{link}">Download</a></p>{players}
  </main>
</body>
</html>
"#,
            name = escape_html(&self.display_name),
            size = escape_html(&self.size),
            link = escape_html(&self.download_link),
        )
    }
}

/// `{base}/dl/{sequence}/{sanitized name}`, with the name percent-encoded.
pub fn download_link(base_url: &str, sequence: u64, name: &str) -> String {
    format!(
        "{base_url}/dl/{sequence}/{}",
        urlencoding::encode(&sanitize_filename(name))
    )
}

/// Hide most of a file name while keeping it recognisable: every third
/// alphanumeric character survives, as do a resolution tag and the
/// extension.
pub fn mask_filename(name: &str) -> String {
    if name.is_empty() {
        return "Protected File".to_string();
    }
    let mut name = name.to_string();
    let mut resolution = String::new();
    if let Some(tag) = RESOLUTION_TAGS.iter().find(|t| name.contains(**t)) {
        resolution = format!(" {tag}");
        name = name.replace(tag, "");
    }
    let (base, ext) = split_extension(&name);
    let masked: String = base
        .chars()
        .enumerate()
        .map(|(i, c)| {
            if i % 3 == 0 && c.is_alphanumeric() {
                c
            } else {
                '*'
            }
        })
        .collect();
    format!("{masked}{resolution}{ext}")
}

/// Split at the last dot, ignoring dots that only lead the name
/// (`.bashrc` has no extension).
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(dot) if name[..dot].chars().any(|c| c != '.') => name.split_at(dot),
        _ => (name, ""),
    }
}

/// Characters safe for a path segment and a `Content-Disposition` value.
pub fn sanitize_filename(name: &str) -> String {
    let safe: String = name
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_' | '-'))
        .collect();
    let safe = safe.trim_end();
    if safe.is_empty() {
        "file".to_string()
    } else {
        safe.to_string()
    }
}

pub fn readable_size(size: u64) -> String {
    if size == 0 {
        return "0 B".to_string();
    }
    let adjusted = Byte::from_u64(size).get_appropriate_unit(UnitType::Binary);
    format!("{adjusted:.2}")
}

fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MediaKind;

    fn media(name: &str, mime: &str, size: u64) -> Media {
        Media {
            kind: MediaKind::from_mime(mime),
            name: name.into(),
            size,
            mime_type: Some(mime.into()),
            partition: "p1".into(),
            last_modified: None,
        }
    }

    #[test]
    fn masking_keeps_every_third_alphanumeric() {
        assert_eq!(mask_filename("abcdefg.txt"), "a**d**g.txt");
        assert_eq!(mask_filename("a b.c"), "a**.c");
        assert_eq!(mask_filename(""), "Protected File");
    }

    #[test]
    fn masking_preserves_resolution_tag() {
        assert_eq!(mask_filename("Movie.1080p.mkv"), "M**i** 1080p.mkv");
    }

    #[test]
    fn leading_dot_is_not_an_extension() {
        assert_eq!(split_extension(".bashrc"), (".bashrc", ""));
        assert_eq!(split_extension("a.tar.gz"), ("a.tar", ".gz"));
    }

    #[test]
    fn sanitizing_drops_unsafe_characters() {
        assert_eq!(sanitize_filename("My \"Film\"/2020?.mp4 "), "My Film2020.mp4");
        assert_eq!(sanitize_filename("???"), "file");
    }

    #[test]
    fn readable_sizes() {
        assert_eq!(readable_size(0), "0 B");
        assert_eq!(readable_size(1_500_000), "1.43 MiB");
    }

    #[test]
    fn video_page_has_player_links() {
        let page = ShowPage::new("https://dl.example", 42, &media("My Clip.mp4", "video/mp4", 10));
        assert_eq!(page.download_link, "https://dl.example/dl/42/My%20Clip.mp4");
        let (intent, vlc) = page.player_links.clone().unwrap();
        assert!(intent.starts_with("intent:https://dl.example/dl/42/"));
        assert!(intent.ends_with("type=video/mp4;end"));
        assert_eq!(vlc, "vlc://https://dl.example/dl/42/My%20Clip.mp4");
        assert!(page.render().contains("Play in VLC"));
    }

    #[test]
    fn document_page_has_no_player_links_and_escapes_text() {
        let page = ShowPage::new("https://dl.example", 1, &media("<b>.pdf", "application/pdf", 10));
        assert!(page.player_links.is_none());
        let html = page.render();
        assert!(!html.contains("<b>"));
        assert!(!html.contains("Play in"));
    }
}
