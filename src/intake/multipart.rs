use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct FormPart {
    pub field: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FormPart {
    pub fn is_file(&self) -> bool {
        self.file_name.is_some()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8], start: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(start);
    }
    if start >= haystack.len() || needle.len() > haystack.len() - start {
        return None;
    }
    haystack[start..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|pos| start + pos)
}

fn skip_line_break(bytes: &[u8], cursor: usize) -> usize {
    if bytes.get(cursor..cursor + 2) == Some(b"\r\n") {
        cursor + 2
    } else if bytes.get(cursor..cursor + 1) == Some(b"\n") {
        cursor + 1
    } else {
        cursor
    }
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value)
}

pub fn boundary_from_content_type(content_type: &str) -> Result<String, String> {
    let mut params = content_type.split(';').map(str::trim);
    let media_type = params.next().unwrap_or_default();
    if !media_type.eq_ignore_ascii_case("multipart/form-data") {
        return Err(format!("expected multipart/form-data, got {media_type:?}"));
    }

    for param in params {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if !key.trim().eq_ignore_ascii_case("boundary") {
            continue;
        }
        let value = unquote(value);
        if !value.trim().is_empty() {
            return Ok(value.to_string());
        }
    }

    Err("multipart boundary is missing".to_string())
}

#[derive(Default)]
struct PartHeaders {
    field: Option<String>,
    file_name: Option<String>,
    content_type: Option<String>,
}

fn parse_part_headers(raw: &str) -> PartHeaders {
    let mut headers = PartHeaders::default();
    for line in raw.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.eq_ignore_ascii_case("content-disposition") {
            for item in value.split(';').map(str::trim) {
                let Some((param, raw_value)) = item.split_once('=') else {
                    continue;
                };
                match param.trim().to_ascii_lowercase().as_str() {
                    "name" => headers.field = Some(unquote(raw_value).to_string()),
                    "filename" => headers.file_name = Some(unquote(raw_value).to_string()),
                    _ => {}
                }
            }
        } else if key.eq_ignore_ascii_case("content-type") && !value.is_empty() {
            headers.content_type = Some(value.to_string());
        }
    }
    headers
}

/// Splits a buffered `multipart/form-data` body into its parts. Part payloads
/// are zero-copy slices of `body`.
pub fn parse_form(content_type: &str, body: &Bytes) -> Result<Vec<FormPart>, String> {
    let boundary = boundary_from_content_type(content_type)?;
    let opening = format!("--{boundary}");
    let delimiter = format!("\r\n--{boundary}");
    let bytes = body.as_ref();

    let Some(start) = find_subslice(bytes, opening.as_bytes(), 0) else {
        return Err("multipart body missing boundary marker".to_string());
    };
    let mut cursor = start + opening.len();
    let mut parts = Vec::new();

    loop {
        if bytes.get(cursor..cursor + 2) == Some(b"--") {
            break;
        }
        cursor = skip_line_break(bytes, cursor);

        let (headers_end, separator_len) = match find_subslice(bytes, b"\r\n\r\n", cursor) {
            Some(idx) => (idx, 4),
            None => match find_subslice(bytes, b"\n\n", cursor) {
                Some(idx) => (idx, 2),
                None => return Err("multipart part missing header separator".to_string()),
            },
        };

        let headers = parse_part_headers(&String::from_utf8_lossy(&bytes[cursor..headers_end]));
        let field = headers
            .field
            .ok_or_else(|| "multipart part missing content-disposition name".to_string())?;

        let data_start = headers_end + separator_len;
        let Some(data_end) = find_subslice(bytes, delimiter.as_bytes(), data_start) else {
            return Err("multipart part missing trailing boundary".to_string());
        };

        parts.push(FormPart {
            field,
            file_name: headers.file_name,
            content_type: headers.content_type,
            data: body.slice(data_start..data_end),
        });

        cursor = data_end + delimiter.len();
    }

    Ok(parts)
}
