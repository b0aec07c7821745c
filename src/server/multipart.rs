use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct FilePart {
    pub filename: String,
    pub data: Vec<u8>,
}

/// A decoded `multipart/form-data` body.
#[derive(Debug, Default)]
pub struct Form {
    fields: HashMap<String, String>,
    files: HashMap<String, FilePart>,
}

impl Form {
    /// Text value of `name`, trimmed. Missing fields read as empty.
    pub fn text(&self, name: &str) -> &str {
        self.fields.get(name).map(|s| s.trim()).unwrap_or("")
    }

    pub fn file(&self, name: &str) -> Option<&FilePart> {
        self.files.get(name)
    }
}

pub fn boundary(content_type: &str) -> Option<&str> {
    let mut parts = content_type.split(';');
    let mime = parts.next()?.trim();
    if !mime.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    parts
        .find_map(|p| p.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .filter(|b| !b.is_empty())
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

fn disposition_param(cd: &str, key: &str) -> Option<String> {
    cd.split(';').skip(1).find_map(|p| {
        let (k, v) = p.trim().split_once('=')?;
        if k.trim().eq_ignore_ascii_case(key) {
            Some(v.trim().trim_matches('"').to_string())
        } else {
            None
        }
    })
}

pub fn parse(content_type: &str, body: &[u8]) -> Result<Form> {
    let boundary = boundary(content_type).ok_or_else(|| anyhow!("not multipart/form-data"))?;
    let marker = format!("--{boundary}").into_bytes();
    let delimiter = format!("\r\n--{boundary}").into_bytes();

    let mut pos = find(body, &marker).ok_or_else(|| anyhow!("bad multipart body"))? + marker.len();
    let mut form = Form::default();

    loop {
        if body[pos..].starts_with(b"--") {
            break;
        }
        if body.get(pos..pos + 2) == Some(b"\r\n") {
            pos += 2;
        }

        let hdr_end = find(&body[pos..], b"\r\n\r\n").ok_or_else(|| anyhow!("bad multipart headers"))?;
        let hdr_text = String::from_utf8_lossy(&body[pos..pos + hdr_end]);
        pos += hdr_end + 4;

        let mut cd = None;
        for line in hdr_text.split("\r\n") {
            if let Some((k, v)) = line.split_once(':') {
                if k.trim().eq_ignore_ascii_case("content-disposition") {
                    cd = Some(v.trim().to_string());
                }
            }
        }
        let cd = cd.ok_or_else(|| anyhow!("missing content-disposition"))?;

        let data_len = find(&body[pos..], &delimiter)
            .ok_or_else(|| anyhow!("bad multipart body (no closing boundary)"))?;
        let data = &body[pos..pos + data_len];
        pos += data_len + delimiter.len();

        let Some(name) = disposition_param(&cd, "name") else {
            continue;
        };
        match disposition_param(&cd, "filename") {
            // A file input left empty still sends a part with filename="".
            Some(filename) if !filename.is_empty() => {
                form.files.insert(
                    name,
                    FilePart {
                        filename,
                        data: data.to_vec(),
                    },
                );
            }
            Some(_) => {}
            None => {
                form.fields
                    .insert(name, String::from_utf8_lossy(data).into_owned());
            }
        }

        if pos >= body.len() {
            bail!("truncated multipart body");
        }
    }

    Ok(form)
}
