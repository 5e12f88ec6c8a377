//! Plain-text rendering of server payloads.

use serde_json::Value;

/// Device table for a `ccdiscovery` value: `[[uuid, name, model], ...]`.
pub fn devices(value: &Value) -> String {
    let rows: Vec<[&str; 3]> = value
        .as_array()
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let fields = entry.as_array()?;
                    let field = |i: usize| fields.get(i).and_then(Value::as_str).unwrap_or("");
                    Some([field(0), field(1), field(2)])
                })
                .collect()
        })
        .unwrap_or_default();

    if rows.is_empty() {
        return "no devices found".to_owned();
    }

    let width = |col: usize, header: &str| {
        rows.iter()
            .map(|row| row[col].len())
            .chain(std::iter::once(header.len()))
            .max()
            .unwrap_or(0)
    };
    let (w0, w1) = (width(0, "UUID"), width(1, "NAME"));

    let mut out = format!("{:<w0$}  {:<w1$}  MODEL", "UUID", "NAME");
    for [uuid, name, model] in rows {
        out.push('\n');
        out.push_str(&format!("{uuid:<w0$}  {name:<w1$}  {model}"));
    }
    out
}

/// File listing for a `listfiles` value: `{files: {id: file}, medias: {key: media}}`.
///
/// The title comes from the linked media entry, then the file's own title,
/// then its path.
pub fn library(value: &Value) -> String {
    let Some(files) = value.get("files").and_then(Value::as_object) else {
        return "library is empty".to_owned();
    };
    if files.is_empty() {
        return "library is empty".to_owned();
    }
    let medias = value.get("medias");

    files
        .iter()
        .map(|(id, file)| {
            let media_title = file
                .get("media")
                .and_then(Value::as_str)
                .and_then(|key| medias?.get(key)?.get("title")?.as_str());
            let title = media_title
                .or_else(|| file.get("title").and_then(Value::as_str))
                .or_else(|| file.get("filepath").and_then(Value::as_str))
                .unwrap_or("(untitled)");
            format!("{id}  {title}")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
