use anyhow::Result;

use folio_core::models::SearchResult;
use folio_core::search::SearchOptions;

use crate::container::ContainerManager;

const EXCERPT_CHARS: usize = 240;

/// `folio search`: query one container and print the hits.
///
/// `opts.prefix` is canonicalized when the folder exists.
pub async fn run_search(
    manager: &ContainerManager,
    container: Option<&str>,
    query: &str,
    k: Option<usize>,
    mut opts: SearchOptions,
    json: bool,
) -> Result<()> {
    let container = manager.resolve(container).await;
    let k = k.unwrap_or(manager.config().retrieval.default_k);
    opts.prefix = opts.prefix.map(|p| p.canonicalize().unwrap_or(p));

    let results = manager.search(&container, query, k, &opts).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    print_results(&results);
    Ok(())
}

fn print_results(results: &[SearchResult]) {
    for (i, result) in results.iter().enumerate() {
        println!("{}. [{:.3}] {}", i + 1, result.score, result.path.display());
        println!(
            "    chunk {} bytes {}..{}",
            result.chunk_index, result.start, result.end
        );
        println!("    excerpt: \"{}\"", excerpt(&result.snippet, EXCERPT_CHARS));
        println!();
    }
}

/// Single-line excerpt of at most `max_chars` characters.
fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &flat[..cut]),
        None => flat,
    }
}
