use ambassador::delegatable_trait;
use serde::{Deserialize, Serialize};
use sha2::{Sha256, Sha384, Sha512};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of PCRs in a TPM 2.0 PC client bank.
pub const PCR_COUNT: u32 = 24;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PcrError {
    #[error("empty PCR selection list, expected at least on selection")]
    EmptyPcrSelectionList,
    #[error("invalid PCR selection list `{0}`")]
    InvalidPcrSelectionString(String),
    #[error("invalid PCR bank `{0}`")]
    InvalidPcrBank(String),
    #[error("invalid PCR slot `{0}`")]
    InvalidPcrSlot(String),
    #[error("PCR index {0} out of range")]
    PcrOutOfRange(u32),
    #[error("{algorithm} digest must be {expected} bytes, got {actual}")]
    DigestLength {
        algorithm: HashAlgorithm,
        expected: usize,
        actual: usize,
    },
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

/// Hash algorithm of a PCR bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    /// TPM_ALG_ID of the algorithm
    pub fn tpm_alg_id(self) -> u16 {
        match self {
            HashAlgorithm::Sha256 => 0x000b,
            HashAlgorithm::Sha384 => 0x000c,
            HashAlgorithm::Sha512 => 0x000d,
        }
    }

    pub fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
            HashAlgorithm::Sha512 => 64,
        }
    }

    /// Hashes the concatenation of `parts`.
    pub fn hash_parts(self, parts: &[&[u8]]) -> Digest {
        match self {
            HashAlgorithm::Sha256 => hash_with::<Sha256>(parts),
            HashAlgorithm::Sha384 => hash_with::<Sha384>(parts),
            HashAlgorithm::Sha512 => hash_with::<Sha512>(parts),
        }
    }

    pub fn hash(self, data: &[u8]) -> Digest {
        self.hash_parts(&[data])
    }

    /// The all-zero value a PCR holds after platform reset.
    pub fn zero_digest(self) -> Digest {
        Digest(vec![0; self.digest_size()])
    }

    /// `PCR_new = H(PCR_old || measurement)`
    pub fn extend(self, old: &Digest, measurement: &Digest) -> Digest {
        self.hash_parts(&[old.as_ref(), measurement.as_ref()])
    }

    pub fn check_digest(self, digest: &Digest) -> Result<()> {
        if digest.len() != self.digest_size() {
            return Err(PcrError::DigestLength {
                algorithm: self,
                expected: self.digest_size(),
                actual: digest.len(),
            });
        }
        Ok(())
    }
}

fn hash_with<H: sha2::Digest>(parts: &[&[u8]]) -> Digest {
    let mut hasher = H::new();
    for part in parts {
        hasher.update(part);
    }
    Digest(hasher.finalize().to_vec())
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = PcrError;

    fn from_str(bank: &str) -> Result<Self> {
        match bank {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            _ => Err(PcrError::InvalidPcrBank(bank.to_string())),
        }
    }
}

/// A digest value, e.g. a PCR value or a measurement.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Digest(Vec<u8>);

impl Digest {
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(hex::decode(s.trim())?))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Digest {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Digest {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// An ordered set of PCRs across one or more banks.
///
/// Iteration order is bank order then ascending PCR index, which is the order
/// the TPM uses when it builds a PCR composite digest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcrSelection(BTreeMap<HashAlgorithm, BTreeSet<u32>>);

impl PcrSelection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selection(mut self, bank: HashAlgorithm, pcrs: &[u32]) -> Result<Self> {
        for &pcr in pcrs {
            self.insert(bank, pcr)?;
        }
        Ok(self)
    }

    pub fn insert(&mut self, bank: HashAlgorithm, pcr: u32) -> Result<()> {
        if pcr >= PCR_COUNT {
            return Err(PcrError::PcrOutOfRange(pcr));
        }
        self.0.entry(bank).or_default().insert(pcr);
        Ok(())
    }

    pub fn contains(&self, bank: HashAlgorithm, pcr: u32) -> bool {
        self.0.get(&bank).map_or(false, |pcrs| pcrs.contains(&pcr))
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeSet::is_empty)
    }

    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HashAlgorithm, u32)> + '_ {
        self.0
            .iter()
            .flat_map(|(bank, pcrs)| pcrs.iter().map(move |pcr| (*bank, *pcr)))
    }

    /// Marshals as a `TPML_PCR_SELECTION`.
    pub fn marshal(&self) -> Vec<u8> {
        let banks: Vec<_> = self.0.iter().filter(|(_, pcrs)| !pcrs.is_empty()).collect();
        let mut buf = Vec::with_capacity(4 + banks.len() * 6);
        buf.extend_from_slice(&(banks.len() as u32).to_be_bytes());
        for (bank, pcrs) in banks {
            buf.extend_from_slice(&bank.tpm_alg_id().to_be_bytes());
            buf.push(3);
            let mut bitmap = [0u8; 3];
            for pcr in pcrs {
                bitmap[(*pcr / 8) as usize] |= 1 << (pcr % 8);
            }
            buf.extend_from_slice(&bitmap);
        }
        buf
    }
}

impl fmt::Display for PcrSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let banks: Vec<String> = self
            .0
            .iter()
            .map(|(bank, pcrs)| {
                let pcrs: Vec<String> = pcrs.iter().map(u32::to_string).collect();
                format!("{}:{}", bank, pcrs.join(","))
            })
            .collect();
        f.write_str(&banks.join("+"))
    }
}

fn parse_slot(slot: &str) -> Result<u32> {
    match slot.parse::<u32>() {
        Ok(pcr) if pcr < PCR_COUNT => Ok(pcr),
        _ => Err(PcrError::InvalidPcrSlot(slot.to_string())),
    }
}

fn parse_slots(slots: &str) -> Result<Vec<u32>> {
    slots.split(',').map(parse_slot).collect()
}

/// Parses `<bank>:<pcr>,<pcr>,...`, multiple banks joined with `+`.
pub fn parse_pcr_selection_list(expression: &str) -> Result<PcrSelection> {
    let mut selection = PcrSelection::new();
    for bank_expression in expression.split('+') {
        let (bank, slots) = bank_expression
            .split_once(':')
            .ok_or_else(|| PcrError::InvalidPcrSelectionString(expression.to_owned()))?;
        let hash_algorithm = bank.parse()?;
        selection = selection.with_selection(hash_algorithm, &parse_slots(slots)?)?;
    }
    if selection.is_empty() {
        return Err(PcrError::EmptyPcrSelectionList);
    }
    Ok(selection)
}

/// Read and extend access to a set of PCR banks.
#[delegatable_trait]
pub trait PcrBank {
    /// Banks that are allocated and extended by measurements.
    fn active_banks(&mut self) -> crate::tpm::Result<Vec<crate::tpm::pcr::HashAlgorithm>>;

    /// Reads the selected PCRs, in selection order.
    fn pcr_read(
        &mut self,
        selection: &crate::tpm::pcr::PcrSelection,
    ) -> crate::tpm::Result<Vec<crate::tpm::pcr::Digest>>;

    /// Extends one PCR in every bank given in `digests`.
    fn pcr_extend(
        &mut self,
        pcr: u32,
        digests: &[(crate::tpm::pcr::HashAlgorithm, crate::tpm::pcr::Digest)],
    ) -> crate::tpm::Result<()>;
}

/// In-memory PCR registers, reset to zero on creation.
#[derive(Debug, Clone)]
pub struct PcrRegisters {
    banks: Vec<HashAlgorithm>,
    values: BTreeMap<(HashAlgorithm, u32), Digest>,
}

impl PcrRegisters {
    pub fn new(banks: &[HashAlgorithm]) -> Self {
        Self {
            banks: banks.to_vec(),
            values: BTreeMap::new(),
        }
    }

    /// Platform reset: every PCR returns to zero.
    pub fn reset(&mut self) {
        self.values.clear();
    }

    fn value(&self, bank: HashAlgorithm, pcr: u32) -> Digest {
        self.values
            .get(&(bank, pcr))
            .cloned()
            .unwrap_or_else(|| bank.zero_digest())
    }

    fn check_bank(&self, bank: HashAlgorithm) -> crate::tpm::Result<()> {
        if !self.banks.contains(&bank) {
            return Err(crate::tpm::TpmError::InvalidParameter(format!(
                "PCR bank {} is not allocated",
                bank
            )));
        }
        Ok(())
    }
}

impl PcrBank for PcrRegisters {
    fn active_banks(&mut self) -> crate::tpm::Result<Vec<HashAlgorithm>> {
        Ok(self.banks.clone())
    }

    fn pcr_read(&mut self, selection: &PcrSelection) -> crate::tpm::Result<Vec<Digest>> {
        selection
            .iter()
            .map(|(bank, pcr)| {
                self.check_bank(bank)?;
                Ok(self.value(bank, pcr))
            })
            .collect()
    }

    fn pcr_extend(&mut self, pcr: u32, digests: &[(HashAlgorithm, Digest)]) -> crate::tpm::Result<()> {
        if pcr >= PCR_COUNT {
            return Err(PcrError::PcrOutOfRange(pcr).into());
        }
        for (bank, digest) in digests {
            self.check_bank(*bank)?;
            bank.check_digest(digest)?;
        }
        for (bank, digest) in digests {
            let new = bank.extend(&self.value(*bank, pcr), digest);
            self.values.insert((*bank, pcr), new);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn parse_no_bank_delimiter() {
        let parsed = parse_pcr_selection_list("1,2,3");
        assert_eq!(
            parsed,
            Err(PcrError::InvalidPcrSelectionString("1,2,3".to_string()))
        );
    }

    #[test]
    fn parse_no_bank() {
        let parsed = parse_pcr_selection_list(":1,2,3");
        assert_eq!(parsed, Err(PcrError::InvalidPcrBank("".to_string())));
    }

    #[test]
    fn parse_bad_bank() {
        let parsed = parse_pcr_selection_list("sha1:1,2,3");
        assert_eq!(parsed, Err(PcrError::InvalidPcrBank("sha1".to_string())));
    }

    #[test]
    fn parse_no_selections() {
        let parsed = parse_pcr_selection_list("sha256:");
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_bad_slot() {
        let parsed = parse_pcr_selection_list("sha256:1,bad,2");
        assert_eq!(parsed, Err(PcrError::InvalidPcrSlot("bad".to_string())));
    }

    #[test]
    fn parse_out_of_range_slot() {
        let parsed = parse_pcr_selection_list("sha256:1,24");
        assert_eq!(parsed, Err(PcrError::InvalidPcrSlot("24".to_string())));
    }

    #[test]
    fn parse_happy_sha256() -> Result<()> {
        let expected = PcrSelection::new().with_selection(HashAlgorithm::Sha256, &[1])?;
        assert_eq!(expected, parse_pcr_selection_list("sha256:1")?);

        let expected = PcrSelection::new()
            .with_selection(HashAlgorithm::Sha256, &[0, 7, 9])?
            .with_selection(HashAlgorithm::Sha384, &[12])?;
        let parsed = parse_pcr_selection_list("sha256:9,0,7+sha384:12")?;
        assert_eq!(expected, parsed);
        assert_eq!(parsed.to_string(), "sha256:0,7,9+sha384:12");
        Ok(())
    }

    #[test]
    fn marshal_selection() -> Result<()> {
        let selection = PcrSelection::new().with_selection(HashAlgorithm::Sha256, &[0, 7, 12])?;
        assert_eq!(
            selection.marshal(),
            vec![0, 0, 0, 1, 0x00, 0x0b, 3, 0b1000_0001, 0b0001_0000, 0]
        );
        Ok(())
    }

    #[test]
    fn extend_is_order_dependent() -> Result<()> {
        let alg = HashAlgorithm::Sha256;
        let a = alg.hash(b"a");
        let b = alg.hash(b"b");
        let selection = PcrSelection::new().with_selection(alg, &[12])?;

        let mut first = PcrRegisters::new(&[alg]);
        first.pcr_extend(12, &[(alg, a.clone())])?;
        first.pcr_extend(12, &[(alg, b.clone())])?;

        let mut second = PcrRegisters::new(&[alg]);
        second.pcr_extend(12, &[(alg, b)])?;
        second.pcr_extend(12, &[(alg, a.clone())])?;

        assert_ne!(first.pcr_read(&selection)?, second.pcr_read(&selection)?);

        let expected = alg.extend(&alg.zero_digest(), &a);
        let mut third = PcrRegisters::new(&[alg]);
        third.pcr_extend(12, &[(alg, a)])?;
        assert_eq!(third.pcr_read(&selection)?, vec![expected]);
        Ok(())
    }

    #[test]
    fn extend_rejects_bad_digest_and_bank() {
        let mut registers = PcrRegisters::new(&[HashAlgorithm::Sha256]);
        assert!(registers
            .pcr_extend(7, &[(HashAlgorithm::Sha256, Digest::from(vec![0u8; 20]))])
            .is_err());
        assert!(registers
            .pcr_extend(7, &[(HashAlgorithm::Sha384, HashAlgorithm::Sha384.hash(b"x"))])
            .is_err());
        assert!(registers
            .pcr_extend(24, &[(HashAlgorithm::Sha256, HashAlgorithm::Sha256.hash(b"x"))])
            .is_err());
    }
}
