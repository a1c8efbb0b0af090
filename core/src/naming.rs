use url::Url;

pub const DEFAULT_FILE_NAME: &str = "download_file";

pub fn resolve_file_name(
    explicit: Option<&str>,
    url: &str,
    content_disposition: Option<&str>,
) -> String {
    explicit
        .map(str::to_string)
        .filter(|name| !name.trim().is_empty())
        .or_else(|| filename_from_content_disposition(content_disposition))
        .or_else(|| filename_from_url(url))
        .map(|name| sanitize_file_name(&name))
        .unwrap_or_else(|| DEFAULT_FILE_NAME.to_string())
}

pub fn filename_from_content_disposition(value: Option<&str>) -> Option<String> {
    let value = value?;
    let mut filename_star: Option<String> = None;
    let mut filename: Option<String> = None;

    for part in value.split(';') {
        let part = part.trim();
        let Some((key, raw)) = part.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let raw = raw.trim().trim_matches('"');
        if key == "filename*" {
            // RFC 5987: charset'lang'percent-encoded
            let encoded = raw.rsplit("''").next().unwrap_or(raw);
            let decoded = percent_decode(encoded);
            if !decoded.is_empty() {
                filename_star = Some(decoded);
            }
        } else if key == "filename" && !raw.is_empty() {
            filename = Some(raw.to_string());
        }
    }

    filename_star.or(filename)
}

pub fn filename_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let name = parsed.path_segments()?.filter(|seg| !seg.is_empty()).last()?;
    let decoded = percent_decode(name);
    if decoded.trim().is_empty() {
        None
    } else {
        Some(decoded)
    }
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut index = 0usize;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[index + 1]), hex_value(bytes[index + 2])) {
                out.push((hi << 4) | lo);
                index += 3;
                continue;
            }
        }
        out.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

pub fn sanitize_file_name(name: &str) -> String {
    let mapped: String = name
        .chars()
        .map(|ch| match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            ch if ch.is_control() => '_',
            ch => ch,
        })
        .collect();
    let trimmed = mapped.trim().trim_start_matches('.').trim();
    if trimmed.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        trimmed.to_string()
    }
}
