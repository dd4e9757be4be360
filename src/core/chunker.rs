//! Splitting a body of source text into task-sized chunks

use crate::core::models::ChunkStrategy;

/// Rough token estimate used for budgeting and equivalent-length prediction
pub fn approx_tokens(text: &str) -> u64 {
    ((text.len() / 4).max(1)) as u64
}

/// Split `content` into independently translatable chunks.
///
/// `Line` groups `chunk_size` non-empty lines per chunk; `Token` packs lines
/// until the approximate token budget is reached. Order is preserved and no
/// chunk is empty.
pub fn chunk_content(content: &str, strategy: ChunkStrategy, chunk_size: usize) -> Vec<String> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    let flush = |current: &mut Vec<&str>, chunks: &mut Vec<String>| {
        if current.iter().any(|l| !l.trim().is_empty()) {
            chunks.push(current.join("\n"));
        }
        current.clear();
    };

    match strategy {
        ChunkStrategy::Line => {
            let mut filled = 0usize;
            for line in content.lines() {
                current.push(line);
                if !line.trim().is_empty() {
                    filled += 1;
                }
                if filled >= chunk_size {
                    flush(&mut current, &mut chunks);
                    filled = 0;
                }
            }
            flush(&mut current, &mut chunks);
        }
        ChunkStrategy::Token => {
            let mut budget = 0u64;
            for line in content.lines() {
                current.push(line);
                budget += approx_tokens(line);
                if budget >= chunk_size as u64 {
                    flush(&mut current, &mut chunks);
                    budget = 0;
                }
            }
            flush(&mut current, &mut chunks);
        }
    }

    chunks
}
