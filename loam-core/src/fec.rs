//! Forward error correction for backhaul uploads.
//!
//! Payloads are cut into fixed-size data shards and protected by interleaved
//! XOR parity. Data shard `i` belongs to parity group `i mod m`, so a burst of
//! up to `m` consecutive lost shards still lands in distinct groups. Every
//! group can lose one shard (data or parity) and be rebuilt.

use serde::{Deserialize, Serialize};

use crate::BoxList;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct FecConfig {
    /// Bytes per shard.
    pub shard_size: usize,
    /// Fraction of shards the code is sized to lose, in `(0, 0.5]`.
    pub loss_tolerance: f64,
}

impl Default for FecConfig {
    fn default() -> Self {
        Self {
            shard_size: 64,
            loss_tolerance: 0.10,
        }
    }
}

impl FecConfig {
    pub fn validate(&self) -> Result<(), FecError> {
        if self.shard_size == 0 || self.shard_size > u16::MAX as usize {
            return Err(FecError::InvalidConfig("shard_size must be in 1..=65535"));
        }
        if !(self.loss_tolerance > 0.0 && self.loss_tolerance <= 0.5) {
            return Err(FecError::InvalidConfig("loss_tolerance must be in (0, 0.5]"));
        }
        Ok(())
    }

    /// Data shards per parity group.
    pub fn group_width(&self) -> usize {
        ((1.0 / self.loss_tolerance).floor() as usize)
            .saturating_sub(1)
            .max(1)
    }
}

/// Shape of an encoded payload. Travels with the shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FecLayout {
    pub payload_len: u32,
    pub shard_size: u16,
    pub data_shards: u16,
    pub parity_shards: u16,
}

impl FecLayout {
    pub fn total_shards(&self) -> usize {
        self.data_shards as usize + self.parity_shards as usize
    }

    /// Parity bytes sent per data byte.
    pub fn overhead(&self) -> f64 {
        self.parity_shards as f64 / self.data_shards as f64
    }

    fn group_of(&self, index: usize) -> usize {
        let data = self.data_shards as usize;
        if index < data {
            index % self.parity_shards as usize
        } else {
            index - data
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Data shards come first, parity shard `j` has index `data_shards + j`.
    pub index: u16,
    pub bytes: BoxList<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FecError {
    #[error("invalid fec config: {0}")]
    InvalidConfig(&'static str),
    #[error("payload of {size} bytes needs more than {max} shards")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("shard {index} does not match layout: {reason}")]
    InvalidShard { index: u16, reason: &'static str },
    #[error("parity group {group} lost {missing} shards")]
    Unrecoverable { group: usize, missing: usize },
    #[error("{received} shards received, at least {needed} needed")]
    TooFewShards { received: usize, needed: usize },
}

/// Split `payload` into data and parity shards.
pub fn encode(payload: &[u8], config: &FecConfig) -> Result<(FecLayout, Vec<Shard>), FecError> {
    config.validate()?;

    let shard_size = config.shard_size;
    let data_shards = payload.len().div_ceil(shard_size).max(1);
    let parity_shards = data_shards.div_ceil(config.group_width());

    if data_shards + parity_shards > u16::MAX as usize || payload.len() > u32::MAX as usize {
        return Err(FecError::PayloadTooLarge {
            size: payload.len(),
            max: u16::MAX as usize,
        });
    }

    let layout = FecLayout {
        payload_len: payload.len() as u32,
        shard_size: shard_size as u16,
        data_shards: data_shards as u16,
        parity_shards: parity_shards as u16,
    };

    let mut parity = vec![vec![0u8; shard_size]; parity_shards];
    let mut shards = Vec::with_capacity(layout.total_shards());

    for index in 0..data_shards {
        let start = index * shard_size;
        let end = (start + shard_size).min(payload.len());
        let mut bytes = vec![0u8; shard_size];
        bytes[..end - start].copy_from_slice(&payload[start..end]);

        xor_into(&mut parity[layout.group_of(index)], &bytes);
        shards.push(Shard {
            index: index as u16,
            bytes: bytes.into_boxed_slice(),
        });
    }

    for (group, bytes) in parity.into_iter().enumerate() {
        shards.push(Shard {
            index: (data_shards + group) as u16,
            bytes: bytes.into_boxed_slice(),
        });
    }

    Ok((layout, shards))
}

/// Rebuild the payload from whichever shards arrived.
///
/// Duplicates are ignored. Fails when any parity group lost more than one shard.
///
/// The layout arrives from the peer, so it is checked against itself and
/// against the shards actually received before anything is allocated.
pub fn reconstruct(layout: &FecLayout, shards: &[Shard]) -> Result<Vec<u8>, FecError> {
    let shard_size = layout.shard_size as usize;
    let data = layout.data_shards as usize;
    let parity = layout.parity_shards as usize;
    let total = layout.total_shards();

    if shard_size == 0 || data == 0 || parity == 0 {
        return Err(FecError::InvalidConfig("empty layout"));
    }
    if parity > data {
        return Err(FecError::InvalidConfig("more parity than data shards"));
    }
    if data != (layout.payload_len as usize).div_ceil(shard_size).max(1) {
        return Err(FecError::InvalidConfig("data shards do not match payload length"));
    }
    // One loss per group at most, so every data shard's worth must be here.
    if shards.len() < total - parity {
        return Err(FecError::TooFewShards {
            received: shards.len(),
            needed: total - parity,
        });
    }

    let mut slots: Vec<Option<&[u8]>> = vec![None; total];
    for shard in shards {
        let index = shard.index as usize;
        if index >= total {
            return Err(FecError::InvalidShard {
                index: shard.index,
                reason: "index out of range",
            });
        }
        if shard.bytes.len() != shard_size {
            return Err(FecError::InvalidShard {
                index: shard.index,
                reason: "wrong shard size",
            });
        }
        slots[index].get_or_insert(&shard.bytes[..]);
    }

    let mut payload = vec![0u8; data * shard_size];
    let mut lost = vec![Vec::new(); layout.parity_shards as usize];

    for (index, slot) in slots.iter().enumerate() {
        if slot.is_none() {
            lost[layout.group_of(index)].push(index);
        }
    }

    if let Some((group, missing)) = lost
        .iter()
        .enumerate()
        .find(|(_, missing)| missing.len() > 1)
    {
        return Err(FecError::Unrecoverable {
            group,
            missing: missing.len(),
        });
    }

    for (index, slot) in slots.iter().take(data).enumerate() {
        if let Some(bytes) = slot {
            payload[index * shard_size..(index + 1) * shard_size].copy_from_slice(bytes);
        }
    }

    for (group, missing) in lost.iter().enumerate() {
        // A lost parity shard needs no repair.
        let Some(&index) = missing.first().filter(|&&i| i < data) else {
            continue;
        };

        let mut rebuilt = vec![0u8; shard_size];
        for (other, slot) in slots.iter().enumerate() {
            if other != index && layout.group_of(other) == group {
                if let Some(bytes) = slot {
                    xor_into(&mut rebuilt, bytes);
                }
            }
        }
        payload[index * shard_size..(index + 1) * shard_size].copy_from_slice(&rebuilt);
    }

    payload.truncate(layout.payload_len as usize);
    Ok(payload)
}

fn xor_into(acc: &mut [u8], bytes: &[u8]) {
    for (a, b) in acc.iter_mut().zip(bytes) {
        *a ^= b;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    fn config() -> FecConfig {
        FecConfig {
            shard_size: 16,
            loss_tolerance: 0.10,
        }
    }

    #[test]
    fn layout_matches_tolerance() {
        let (layout, shards) = encode(&payload(1000), &config()).unwrap();

        // 1000 / 16 -> 63 data shards, groups of 9 -> 7 parity shards
        assert_eq!(layout.data_shards, 63);
        assert_eq!(layout.parity_shards, 7);
        assert_eq!(shards.len(), 70);
        assert!(layout.overhead() < 0.12);
    }

    #[test]
    fn intact_shards_round_trip() {
        let data = payload(250);
        let (layout, shards) = encode(&data, &config()).unwrap();
        assert_eq!(reconstruct(&layout, &shards).unwrap(), data);
    }

    #[test]
    fn one_loss_per_group_is_recovered() {
        let data = payload(1000);
        let (layout, shards) = encode(&data, &config()).unwrap();

        // drop the first data shard of every group
        let kept: Vec<_> = shards
            .into_iter()
            .filter(|s| s.index >= layout.parity_shards)
            .collect();
        assert_eq!(reconstruct(&layout, &kept).unwrap(), data);
    }

    #[test]
    fn ten_percent_spread_loss_is_recovered() {
        let data = payload(1000);
        let (layout, shards) = encode(&data, &config()).unwrap();

        // every tenth shard, which never hits the same group twice
        let kept: Vec<_> = shards.into_iter().filter(|s| s.index % 10 != 3).collect();
        assert_eq!(layout.total_shards() - kept.len(), 7);
        assert_eq!(reconstruct(&layout, &kept).unwrap(), data);
    }

    #[test]
    fn burst_loss_spans_groups() {
        let data = payload(1000);
        let (layout, shards) = encode(&data, &config()).unwrap();

        let burst = 20..20 + layout.parity_shards;
        let kept: Vec<_> = shards
            .into_iter()
            .filter(|s| !burst.contains(&s.index))
            .collect();
        assert_eq!(reconstruct(&layout, &kept).unwrap(), data);
    }

    #[test]
    fn lost_parity_is_harmless() {
        let data = payload(100);
        let (layout, shards) = encode(&data, &config()).unwrap();
        let kept: Vec<_> = shards
            .into_iter()
            .filter(|s| s.index < layout.data_shards)
            .collect();
        assert_eq!(reconstruct(&layout, &kept).unwrap(), data);
    }

    #[test]
    fn two_losses_in_one_group_are_unrecoverable() {
        let (layout, shards) = encode(&payload(1000), &config()).unwrap();
        let m = layout.parity_shards;

        // shards 0 and m share group 0
        let kept: Vec<_> = shards
            .into_iter()
            .filter(|s| s.index != 0 && s.index != m)
            .collect();
        assert_eq!(
            reconstruct(&layout, &kept).unwrap_err(),
            FecError::Unrecoverable {
                group: 0,
                missing: 2
            }
        );
    }

    #[test]
    fn empty_payload_encodes() {
        let (layout, shards) = encode(&[], &config()).unwrap();
        assert_eq!(layout.data_shards, 1);
        assert!(reconstruct(&layout, &shards[..1]).unwrap().is_empty());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = FecConfig {
            shard_size: 16,
            loss_tolerance: 0.0,
        };
        assert!(matches!(
            encode(b"x", &bad),
            Err(FecError::InvalidConfig(_))
        ));
    }

    #[test]
    fn forged_layout_is_rejected_before_allocating() {
        let (_, shards) = encode(&payload(40), &config()).unwrap();
        let huge = FecLayout {
            payload_len: u32::MAX,
            shard_size: u16::MAX,
            data_shards: u16::MAX,
            parity_shards: 1,
        };
        assert!(matches!(
            reconstruct(&huge, &shards),
            Err(FecError::InvalidConfig(_))
        ));

        // a self-consistent layout still needs the shards to back it
        let claimed = FecLayout {
            payload_len: 60_000 * 16,
            shard_size: 16,
            data_shards: 60_000,
            parity_shards: 6_000,
        };
        assert_eq!(
            reconstruct(&claimed, &shards).unwrap_err(),
            FecError::TooFewShards {
                received: shards.len(),
                needed: 60_000,
            }
        );
    }

    #[test]
    fn parity_heavy_layout_is_rejected() {
        let (mut layout, shards) = encode(&payload(40), &config()).unwrap();
        layout.parity_shards = layout.data_shards + 1;
        assert!(matches!(
            reconstruct(&layout, &shards),
            Err(FecError::InvalidConfig(_))
        ));
    }

    #[test]
    fn mismatched_shard_size_is_rejected() {
        let (layout, mut shards) = encode(&payload(40), &config()).unwrap();
        shards[0].bytes = vec![0u8; 3].into_boxed_slice();
        assert!(matches!(
            reconstruct(&layout, &shards),
            Err(FecError::InvalidShard { index: 0, .. })
        ));
    }
}
