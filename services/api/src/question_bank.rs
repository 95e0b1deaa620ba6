use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;
use viva_core::Identity;
use viva_core::question_store::QuestionStore;

/// Reads every `<identity>.txt` file in `dir_path`. Each non-blank line is one
/// question; line order is question order.
pub fn load_banks(dir_path: &Path) -> Result<HashMap<String, Vec<String>>> {
    let mut banks = HashMap::new();

    for entry in fs::read_dir(dir_path)
        .with_context(|| format!("Failed to read question bank directory: {}", dir_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();

        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("txt") {
            let identity = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem for question bank file")?
                .to_string();

            let content = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read question bank file: {}", path.display()))?;

            let questions = content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect();

            banks.insert(identity, questions);
        }
    }

    Ok(banks)
}

/// Loads the banks in `dir_path` into `store`, replacing each identity's
/// previous questions. Returns how many identities were seeded.
pub async fn seed(store: &dyn QuestionStore, dir_path: &Path) -> Result<usize> {
    let banks = load_banks(dir_path)?;
    for (identity, texts) in &banks {
        let identity = Identity::new(identity.as_str());
        store
            .replace_questions(&identity, texts)
            .await
            .with_context(|| format!("Failed to seed questions for {identity}"))?;
        info!(%identity, questions = texts.len(), "Seeded question bank");
    }
    Ok(banks.len())
}
