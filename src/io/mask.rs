//! Packed flag masks.
//!
//! A mask item is an int32 item whose words each carry 31 flags, least
//! significant bit first. Bit 31 is never used, so words are always
//! non-negative. Flag `n` lives in word `n / 31`, bit `n % 31`.

use super::{
    error::IOError,
    item::{Item, ItemType},
};

/// Number of flags packed into each 32-bit word.
pub const FLAGS_PER_WORD: u64 = 31;

/// Prepare a freshly opened mask item: new items get their int32 tag,
/// existing ones must already carry it.
pub fn init_mask(item: &mut Item) -> Result<(), IOError> {
    if item.size() == 0 {
        item.write_tag(ItemType::Int32)
    } else {
        item.expect_type(ItemType::Int32)
    }
}

/// Number of flags the mask can currently answer for.
pub fn mask_capacity(item: &Item) -> u64 {
    item.element_count(ItemType::Int32) as u64 * FLAGS_PER_WORD
}

fn word_offset(word: u64) -> u64 {
    ItemType::Int32.data_offset() + 4 * word
}

/// Read `flags.len()` flags starting at flag index `start`.
pub fn read_flags(item: &mut Item, start: u64, flags: &mut [bool]) -> Result<(), IOError> {
    if flags.is_empty() {
        return Ok(());
    }
    let first_word = start / FLAGS_PER_WORD;
    let last_word = (start + flags.len() as u64 - 1) / FLAGS_PER_WORD;
    let mut words = vec![0_i32; (last_word - first_word + 1) as usize];
    item.read_i32s(word_offset(first_word), &mut words)?;
    for (i, flag) in flags.iter_mut().enumerate() {
        let idx = start + i as u64;
        let word = words[(idx / FLAGS_PER_WORD - first_word) as usize];
        *flag = (word >> (idx % FLAGS_PER_WORD)) & 1 != 0;
    }
    Ok(())
}

/// Write `flags` starting at flag index `start`, preserving neighbouring
/// flags that share the boundary words.
pub fn write_flags(item: &mut Item, start: u64, flags: &[bool]) -> Result<(), IOError> {
    if flags.is_empty() {
        return Ok(());
    }
    let first_word = start / FLAGS_PER_WORD;
    let last_word = (start + flags.len() as u64 - 1) / FLAGS_PER_WORD;
    let mut words = vec![0_i32; (last_word - first_word + 1) as usize];

    let stored_words = item.element_count(ItemType::Int32) as u64;
    if stored_words > first_word {
        let n_existing = (stored_words.min(last_word + 1) - first_word) as usize;
        item.read_i32s(word_offset(first_word), &mut words[..n_existing])?;
    }

    for (i, &flag) in flags.iter().enumerate() {
        let idx = start + i as u64;
        let word = &mut words[(idx / FLAGS_PER_WORD - first_word) as usize];
        let bit = 1_i32 << (idx % FLAGS_PER_WORD);
        if flag {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }
    item.write_i32s(word_offset(first_word), &words)
}
