//! Synthetic documents: random element ids and width/height edits.

use crdt_attrs::{Doc, DocError, Entry, Layout, PatchRequest};
use rand::distributions::{Alphanumeric, Distribution, Uniform};
use rand::Rng;

const ALPHA: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// An 8-character element id: one letter followed by seven alphanumerics.
pub fn generate_id(rng: &mut impl Rng) -> String {
    let first = ALPHA[rng.gen_range(0..ALPHA.len())] as char;
    let rest = Alphanumeric.sample_iter(&mut *rng).take(7).map(char::from);
    std::iter::once(first).chain(rest).collect()
}

/// A random dimension in `0..=1000`, as a string.
pub fn random_dimension(rng: &mut impl Rng) -> String {
    Uniform::new_inclusive(0u32, 1000).sample(rng).to_string()
}

/// Create `count` elements with `width=100, height=200`. Returns their ids.
pub fn hydrate(
    doc: &mut Doc,
    layout: Layout,
    count: usize,
    rng: &mut impl Rng,
) -> Result<Vec<String>, DocError> {
    let mut ids = Vec::with_capacity(count);
    while ids.len() < count {
        let id = generate_id(rng);
        match doc.create_element(
            &id,
            "div",
            layout,
            [Entry::new("width", "100"), Entry::new("height", "200")],
        ) {
            Ok(()) => ids.push(id),
            // Collisions are possible, if unlikely; draw again.
            Err(DocError::DuplicateElement(_)) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(ids)
}

/// Set a random width and height on every element, `rounds` times.
pub fn update(
    doc: &mut Doc,
    ids: &[String],
    rounds: usize,
    rng: &mut impl Rng,
) -> Result<(), DocError> {
    for _ in 0..rounds {
        for id in ids {
            let request = PatchRequest::new()
                .set("width", random_dimension(rng))
                .set("height", random_dimension(rng));
            doc.patch(id, &request)?;
        }
    }
    Ok(())
}
