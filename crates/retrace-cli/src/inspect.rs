use anyhow::Context;
use retrace_core::{parse_transcript, Format, RecordFile, RecordedResponse};
use std::fmt::Write;
use std::path::Path;

/// Human-readable summary of a recording file, chosen by its suffix.
pub fn describe(path: &Path) -> anyhow::Result<String> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if name.ends_with(".websocket.log") {
        describe_transcript(path)
    } else if name.ends_with(".req") {
        describe_request(path)
    } else if name.ends_with(".resp") {
        describe_response(path)
    } else {
        describe_record_file(path)
    }
}

fn describe_record_file(path: &Path) -> anyhow::Result<String> {
    let file = RecordFile::open(path)?;
    let mut out = String::new();
    writeln!(out, "Record ID:    {}", file.record_id)?;
    writeln!(out, "Interactions: {}", file.len())?;
    if file.is_empty() {
        writeln!(out, "  (nothing recorded)")?;
    }
    for (i, interaction) in file.interactions.iter().enumerate() {
        writeln!(out, "  [{}] {}", i, interaction.sha_sum)?;
        if let Some(request) = &interaction.request {
            writeln!(out, "      request:  {}", request.request)?;
            writeln!(out, "      previous: {}", request.previous_request)?;
        }
        match &interaction.response {
            Some(response) => writeln!(out, "      status:   {}", response.status_code)?,
            None => writeln!(out, "      status:   (none)")?,
        }
    }
    Ok(out)
}

fn describe_request(path: &Path) -> anyhow::Result<String> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let request = Format::Text.deserialize_request(&data)?;
    let mut out = String::new();
    writeln!(out, "Request:  {}", request.request)?;
    writeln!(out, "Previous: {}", request.previous_request)?;
    writeln!(
        out,
        "Target:   {}://{}:{}",
        request.protocol, request.server_address, request.port
    )?;
    writeln!(out, "Headers:  {}", request.headers.len())?;
    Ok(out)
}

fn describe_response(path: &Path) -> anyhow::Result<String> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let response = RecordedResponse::from_dump(&data)?;
    let mut out = String::new();
    writeln!(out, "Status:   {}", response.status_code)?;
    for (name, values) in &response.headers {
        writeln!(out, "  {}: {}", name, values.join(", "))?;
    }
    Ok(out)
}

fn describe_transcript(path: &Path) -> anyhow::Result<String> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let entries = parse_transcript(&data)?;
    let mut out = String::new();
    writeln!(out, "Frames: {}", entries.len())?;
    for (i, entry) in entries.iter().enumerate() {
        writeln!(out, "  [{}] {} {} bytes", i, entry.direction, entry.payload.len())?;
    }
    Ok(out)
}
