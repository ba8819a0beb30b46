use rand::Rng;
use time::OffsetDateTime;

use crate::format::TargetFormat;

const SUFFIX_LEN: usize = 6;
const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Builds the object name for a converted file.
///
/// The name is `{stem}-{unix millis}-{6 base36 chars}.{ext}`. Nothing checks
/// the bucket for an existing object with the same name; a clash would only
/// overwrite an earlier upload.
pub fn generate_filename(original_name: &str, format: TargetFormat) -> String {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    format!(
        "{}-{millis}-{}.{}",
        file_stem(original_name),
        random_suffix(),
        format.extension()
    )
}

/// Drops the last dot-delimited segment. Names without one (or dotfiles,
/// which would otherwise become empty) are kept whole.
pub fn file_stem(original_name: &str) -> &str {
    match original_name.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => original_name,
    }
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..SUFFIX_LEN)
        .map(|_| char::from(BASE36[rng.gen_range(0..BASE36.len())]))
        .collect()
}
