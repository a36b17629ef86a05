/// Line-based `key=value` rewrite that keeps comments and ordering.
/// Returns the new text and whether anything changed.
pub fn rewrite(existing: &str, updates: &[(&str, String)]) -> (String, bool) {
    let mut out = String::with_capacity(existing.len() + 64);
    let mut seen = vec![false; updates.len()];
    let mut changed = false;

    for line in existing.lines() {
        let trimmed = line.trim_start();
        if !trimmed.starts_with('#')
            && let Some((k, v)) = trimmed.split_once('=')
            && let Some(idx) = updates.iter().position(|(key, _)| *key == k.trim())
        {
            let want = &updates[idx].1;
            if seen[idx] {
                // Duplicate key; the first occurrence already carries the value.
                changed = true;
                continue;
            }
            seen[idx] = true;
            if v.trim() != want {
                changed = true;
            }
            out.push_str(&format!("{}={}\n", updates[idx].0, want));
            continue;
        }
        out.push_str(line);
        out.push('\n');
    }

    for (idx, (k, v)) in updates.iter().enumerate() {
        if !seen[idx] {
            out.push_str(&format!("{k}={v}\n"));
            changed = true;
        }
    }

    (out, changed)
}

/// Applies `updates` to the file; a missing file yields `Ok(false)` without creating it.
pub async fn update_file(path: &std::path::Path, updates: &[(&str, String)]) -> anyhow::Result<bool> {
    use anyhow::Context;

    let existing = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
    };
    let (next, changed) = rewrite(&existing, updates);
    if changed {
        tokio::fs::write(path, next)
            .await
            .with_context(|| format!("write {}", path.display()))?;
    }
    Ok(true)
}
