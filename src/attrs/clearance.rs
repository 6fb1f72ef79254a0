//! Clearance levels and national equivalency.
//!
//! The hub speaks a five-level canonical clearance vocabulary.  Each partner
//! nation labels its data with national terms ("TRÈS SECRET DÉFENSE",
//! "STRENG GEHEIM"); the equivalency store maps those terms back onto the
//! canonical lattice so that access decisions compare like with like.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::attrs::CountryCode;

//----------- Clearance --------------------------------------------------------

/// A canonical clearance level.
///
/// The derived ordering is the authorization lattice: a subject cleared at
/// some level may access data at that level and below.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Clearance {
    #[default]
    Unclassified,
    Restricted,
    Confidential,
    Secret,
    TopSecret,
}

impl Clearance {
    /// All levels, lowest first.
    pub const ALL: [Clearance; 5] = [
        Clearance::Unclassified,
        Clearance::Restricted,
        Clearance::Confidential,
        Clearance::Secret,
        Clearance::TopSecret,
    ];

    /// The numeric level of this clearance.
    ///
    /// Injective on the canonical set; higher means more sensitive.
    pub fn level(self) -> u8 {
        match self {
            Clearance::Unclassified => 0,
            Clearance::Restricted => 1,
            Clearance::Confidential => 2,
            Clearance::Secret => 3,
            Clearance::TopSecret => 4,
        }
    }

    /// The canonical wire spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Clearance::Unclassified => "UNCLASSIFIED",
            Clearance::Restricted => "RESTRICTED",
            Clearance::Confidential => "CONFIDENTIAL",
            Clearance::Secret => "SECRET",
            Clearance::TopSecret => "TOP_SECRET",
        }
    }
}

impl fmt::Display for Clearance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Clearance {
    type Err = UnknownClearance;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match fold_term(s).as_str() {
            "UNCLASSIFIED" => Ok(Clearance::Unclassified),
            "RESTRICTED" => Ok(Clearance::Restricted),
            "CONFIDENTIAL" => Ok(Clearance::Confidential),
            "SECRET" => Ok(Clearance::Secret),
            "TOP_SECRET" => Ok(Clearance::TopSecret),
            _ => Err(UnknownClearance),
        }
    }
}

/// An error parsing a canonical clearance level.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownClearance;

impl std::error::Error for UnknownClearance {}

impl fmt::Display for UnknownClearance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not a canonical clearance level")
    }
}

//----------- Confidence -------------------------------------------------------

/// How a clearance term was resolved.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    /// The term was already a canonical spelling.
    Exact,

    /// The term matched a national equivalency entry.
    Mapped,

    /// The term was unknown and collapsed to the safe default.
    Fallback,
}

//----------- NormalizedClearance ----------------------------------------------

/// The outcome of a clearance lookup.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedClearance {
    /// The canonical level.
    pub normalized: Clearance,

    /// The country whose vocabulary resolved the term.
    pub country: CountryCode,

    /// How the term was resolved.
    pub confidence: Confidence,
}

//----------- EquivalencyEntry -------------------------------------------------

/// National equivalents of one canonical level in one country.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct EquivalencyEntry {
    /// National terms, preferred spelling first.
    pub terms: Vec<String>,

    /// Whether this level requires multi-factor authentication.
    pub mfa_required: bool,

    /// NIST authenticator assurance level for this clearance tier.
    pub aal: u8,

    /// The ACR value the national IdP asserts for this tier.
    pub acr: String,

    /// Human-readable description.
    pub description: String,
}

//----------- ClearanceStore ---------------------------------------------------

/// The persisted clearance equivalency mapping.
///
/// Lookup decomposes terms, strips combining marks, and uppercases, so
/// "TRÈS SECRET DÉFENSE" and "tres_secret_defense" resolve identically.
/// Updates replace a whole country atomically and are validated first.
#[derive(Debug)]
pub struct ClearanceStore {
    state: Mutex<StoreState>,
}

#[derive(Clone, Debug, Default)]
struct StoreState {
    /// Canonical level and country to entry.
    countries: BTreeMap<CountryCode, BTreeMap<Clearance, EquivalencyEntry>>,

    /// Folded term and country to canonical level, rebuilt on mutation.
    index: BTreeMap<(CountryCode, String), Clearance>,
}

impl ClearanceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
        }
    }

    /// Create a store seeded with the built-in coalition vocabularies.
    pub fn with_defaults() -> Self {
        let store = Self::new();
        for (country, entries) in seed_entries() {
            store
                .replace_country(country, entries)
                .expect("the built-in seed table is valid");
        }
        store
    }

    /// Resolve a national term against a country's vocabulary.
    ///
    /// This never fails: unknown terms collapse to [`Clearance::Unclassified`]
    /// with [`Confidence::Fallback`].
    pub fn normalize(&self, term: &str, country: CountryCode) -> NormalizedClearance {
        let folded = fold_term(term);

        // A canonical spelling wins outright.
        if let Ok(level) = folded.parse::<Clearance>() {
            return NormalizedClearance {
                normalized: level,
                country,
                confidence: Confidence::Exact,
            };
        }

        let state = self.state.lock().unwrap();
        if let Some(&level) = state.index.get(&(country, folded)) {
            return NormalizedClearance {
                normalized: level,
                country,
                confidence: Confidence::Mapped,
            };
        }

        NormalizedClearance {
            normalized: Clearance::Unclassified,
            country,
            confidence: Confidence::Fallback,
        }
    }

    /// The preferred national spelling of a canonical level.
    pub fn national_term(&self, level: Clearance, country: CountryCode) -> Option<String> {
        let state = self.state.lock().unwrap();
        state
            .countries
            .get(&country)?
            .get(&level)?
            .terms
            .first()
            .cloned()
    }

    /// The equivalency entry for a canonical level in a country.
    pub fn entry(&self, level: Clearance, country: CountryCode) -> Option<EquivalencyEntry> {
        let state = self.state.lock().unwrap();
        state.countries.get(&country)?.get(&level).cloned()
    }

    /// The countries with a complete vocabulary.
    pub fn countries(&self) -> Vec<CountryCode> {
        let state = self.state.lock().unwrap();
        state.countries.keys().copied().collect()
    }

    /// Atomically replace the vocabulary of one country.
    ///
    /// The replacement must cover all five canonical levels, and no folded
    /// term may appear under two levels.
    pub fn replace_country(
        &self,
        country: CountryCode,
        entries: BTreeMap<Clearance, EquivalencyEntry>,
    ) -> Result<(), EquivalencyError> {
        for level in Clearance::ALL {
            if !entries.contains_key(&level) {
                return Err(EquivalencyError::MissingLevel(level));
            }
        }

        // Build the index fragment up front so a validation failure leaves
        // the store untouched.
        let mut fragment = BTreeMap::new();
        for (&level, entry) in &entries {
            if entry.terms.is_empty() {
                return Err(EquivalencyError::EmptyTerms(level));
            }
            for term in &entry.terms {
                let folded = fold_term(term);
                if let Some(prev) = fragment.insert((country, folded), level) {
                    if prev != level {
                        return Err(EquivalencyError::AmbiguousTerm {
                            term: term.clone(),
                            first: prev,
                            second: level,
                        });
                    }
                }
            }
        }

        let mut state = self.state.lock().unwrap();
        state.index.retain(|(c, _), _| *c != country);
        state.index.extend(fragment);
        state.countries.insert(country, entries);
        Ok(())
    }

    /// A snapshot of every country's vocabulary.
    pub fn snapshot(&self) -> BTreeMap<CountryCode, BTreeMap<Clearance, EquivalencyEntry>> {
        self.state.lock().unwrap().countries.clone()
    }
}

impl Default for ClearanceStore {
    fn default() -> Self {
        Self::with_defaults()
    }
}

//----------- EquivalencyError -------------------------------------------------

/// An error updating the equivalency store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EquivalencyError {
    /// A canonical level has no entry.
    MissingLevel(Clearance),

    /// A canonical level has an empty term list.
    EmptyTerms(Clearance),

    /// A national term maps to two canonical levels.
    AmbiguousTerm {
        term: String,
        first: Clearance,
        second: Clearance,
    },
}

impl std::error::Error for EquivalencyError {}

impl fmt::Display for EquivalencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingLevel(level) => {
                write!(f, "no national terms provided for {level}")
            }
            Self::EmptyTerms(level) => {
                write!(f, "the term list for {level} is empty")
            }
            Self::AmbiguousTerm {
                term,
                first,
                second,
            } => {
                write!(f, "the term '{term}' maps to both {first} and {second}")
            }
        }
    }
}

//----------- Folding ----------------------------------------------------------

/// Fold a national term for lookup.
///
/// NFD-decompose, drop combining marks, uppercase, and squash separators to
/// single underscores.
fn fold_term(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    let mut last_sep = true;
    for c in term.nfd() {
        if is_combining_mark(c) {
            continue;
        }
        if c.is_alphanumeric() {
            out.extend(c.to_uppercase());
            last_sep = false;
        } else if !last_sep {
            out.push('_');
            last_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }
    out
}

//----------- Seed data --------------------------------------------------------

fn entry(
    terms: &[&str],
    mfa_required: bool,
    aal: u8,
    acr: &str,
    description: &str,
) -> EquivalencyEntry {
    EquivalencyEntry {
        terms: terms.iter().map(|t| t.to_string()).collect(),
        mfa_required,
        aal,
        acr: acr.into(),
        description: description.into(),
    }
}

/// The built-in coalition vocabularies.
fn seed_entries() -> Vec<(CountryCode, BTreeMap<Clearance, EquivalencyEntry>)> {
    use Clearance::*;

    let usa = BTreeMap::from([
        (
            Unclassified,
            entry(&["UNCLASSIFIED"], false, 1, "aal1", "No clearance required"),
        ),
        (
            Restricted,
            entry(
                &["CONTROLLED UNCLASSIFIED INFORMATION", "CUI"],
                false,
                1,
                "aal1",
                "Controlled but unclassified",
            ),
        ),
        (
            Confidential,
            entry(&["CONFIDENTIAL"], true, 2, "aal2", "Confidential clearance"),
        ),
        (
            Secret,
            entry(&["SECRET"], true, 2, "aal2", "Secret clearance"),
        ),
        (
            TopSecret,
            entry(
                &["TOP SECRET", "TS", "TS/SCI"],
                true,
                3,
                "aal3",
                "Top Secret clearance",
            ),
        ),
    ]);

    let fra = BTreeMap::from([
        (
            Unclassified,
            entry(&["NON PROTÉGÉ"], false, 1, "aal1", "Information non protégée"),
        ),
        (
            Restricted,
            entry(
                &["DIFFUSION RESTREINTE"],
                false,
                1,
                "aal1",
                "Diffusion restreinte",
            ),
        ),
        (
            Confidential,
            entry(
                &["CONFIDENTIEL DÉFENSE"],
                true,
                2,
                "aal2",
                "Confidentiel défense",
            ),
        ),
        (
            Secret,
            entry(&["SECRET DÉFENSE"], true, 2, "aal2", "Secret défense"),
        ),
        (
            TopSecret,
            entry(
                &["TRÈS SECRET DÉFENSE", "TRÈS SECRET"],
                true,
                3,
                "aal3",
                "Très secret défense",
            ),
        ),
    ]);

    let can = BTreeMap::from([
        (
            Unclassified,
            entry(&["UNCLASSIFIED"], false, 1, "aal1", "No clearance required"),
        ),
        (
            Restricted,
            entry(
                &["PROTECTED B", "PROTECTED A"],
                false,
                1,
                "aal1",
                "Protected information",
            ),
        ),
        (
            Confidential,
            entry(&["CONFIDENTIAL"], true, 2, "aal2", "Confidential clearance"),
        ),
        (
            Secret,
            entry(&["SECRET"], true, 2, "aal2", "Secret clearance"),
        ),
        (
            TopSecret,
            entry(&["TOP SECRET"], true, 3, "aal3", "Top Secret clearance"),
        ),
    ]);

    let deu = BTreeMap::from([
        (
            Unclassified,
            entry(&["OFFEN"], false, 1, "aal1", "Offene Information"),
        ),
        (
            Restricted,
            entry(
                &["VS-NUR FÜR DEN DIENSTGEBRAUCH", "VS-NFD"],
                false,
                1,
                "aal1",
                "Verschlusssache, nur für den Dienstgebrauch",
            ),
        ),
        (
            Confidential,
            entry(&["VS-VERTRAULICH"], true, 2, "aal2", "VS-Vertraulich"),
        ),
        (Secret, entry(&["GEHEIM"], true, 2, "aal2", "Geheim")),
        (
            TopSecret,
            entry(&["STRENG GEHEIM"], true, 3, "aal3", "Streng Geheim"),
        ),
    ]);

    let gbr = BTreeMap::from([
        (
            Unclassified,
            entry(&["OFFICIAL"], false, 1, "aal1", "Official information"),
        ),
        (
            Restricted,
            entry(
                &["OFFICIAL-SENSITIVE"],
                false,
                1,
                "aal1",
                "Official-Sensitive information",
            ),
        ),
        (
            Confidential,
            entry(
                &["CONFIDENTIAL"],
                true,
                2,
                "aal2",
                "Legacy Confidential clearance",
            ),
        ),
        (
            Secret,
            entry(&["SECRET"], true, 2, "aal2", "Secret clearance"),
        ),
        (
            TopSecret,
            entry(&["TOP SECRET"], true, 3, "aal3", "Top Secret clearance"),
        ),
    ]);

    vec![
        (CountryCode::USA, usa),
        (CountryCode::FRA, fra),
        (CountryCode::CAN, can),
        (CountryCode::DEU, deu),
        (CountryCode::GBR, gbr),
    ]
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lattice_is_totally_ordered() {
        assert!(Clearance::TopSecret.level() > Clearance::Secret.level());
        assert!(Clearance::Secret.level() > Clearance::Confidential.level());
        assert!(Clearance::Confidential.level() > Clearance::Restricted.level());
        assert!(Clearance::Restricted.level() > Clearance::Unclassified.level());

        // 'level' is injective on the canonical set.
        let mut levels: Vec<u8> = Clearance::ALL.iter().map(|c| c.level()).collect();
        levels.dedup();
        assert_eq!(levels.len(), Clearance::ALL.len());
    }

    #[test]
    fn folding_is_diacritic_insensitive() {
        assert_eq!(fold_term("TRÈS_SECRET_DÉFENSE"), "TRES_SECRET_DEFENSE");
        assert_eq!(fold_term("très secret défense"), "TRES_SECRET_DEFENSE");
        assert_eq!(fold_term("  Streng  Geheim "), "STRENG_GEHEIM");
    }

    #[test]
    fn national_terms_resolve() {
        let store = ClearanceStore::with_defaults();

        let res = store.normalize("TRÈS_SECRET_DÉFENSE", CountryCode::FRA);
        assert_eq!(res.normalized, Clearance::TopSecret);
        assert_eq!(res.confidence, Confidence::Mapped);

        let res = store.normalize("GEHEIM", CountryCode::DEU);
        assert_eq!(res.normalized, Clearance::Secret);
        assert_eq!(res.confidence, Confidence::Mapped);

        let res = store.normalize("PROTECTED B", CountryCode::CAN);
        assert_eq!(res.normalized, Clearance::Restricted);
        assert_eq!(res.confidence, Confidence::Mapped);
    }

    #[test]
    fn canonical_terms_are_exact() {
        let store = ClearanceStore::with_defaults();
        let res = store.normalize("TOP_SECRET", CountryCode::FRA);
        assert_eq!(res.normalized, Clearance::TopSecret);
        assert_eq!(res.confidence, Confidence::Exact);
    }

    #[test]
    fn unknown_terms_fall_back() {
        let store = ClearanceStore::with_defaults();
        let res = store.normalize("COSMIC ULTRAVIOLET", CountryCode::USA);
        assert_eq!(res.normalized, Clearance::Unclassified);
        assert_eq!(res.confidence, Confidence::Fallback);
    }

    #[test]
    fn round_trip_every_level_and_country() {
        let store = ClearanceStore::with_defaults();
        for country in store.countries() {
            for level in Clearance::ALL {
                let term = store.national_term(level, country).unwrap();
                let res = store.normalize(&term, country);
                assert_eq!(res.normalized, level, "{term} in {country}");
                assert_ne!(res.confidence, Confidence::Fallback);
            }
        }
    }

    #[test]
    fn replace_requires_all_levels() {
        let store = ClearanceStore::new();
        let partial = BTreeMap::from([(
            Clearance::Secret,
            entry(&["SECRET"], true, 2, "aal2", ""),
        )]);
        assert_eq!(
            store.replace_country(CountryCode::USA, partial),
            Err(EquivalencyError::MissingLevel(Clearance::Unclassified))
        );
    }

    #[test]
    fn replace_rejects_ambiguous_terms() {
        let store = ClearanceStore::new();
        let mut entries: BTreeMap<_, _> = Clearance::ALL
            .iter()
            .map(|&l| (l, entry(&[l.as_str()], false, 1, "aal1", "")))
            .collect();
        entries
            .get_mut(&Clearance::Secret)
            .unwrap()
            .terms
            .push("CONFIDENTIAL".into());

        let err = store
            .replace_country(CountryCode::USA, entries)
            .unwrap_err();
        assert!(matches!(err, EquivalencyError::AmbiguousTerm { .. }));
    }

    #[test]
    fn replace_is_atomic() {
        let store = ClearanceStore::with_defaults();
        let before = store.snapshot();

        let partial = BTreeMap::from([(
            Clearance::Secret,
            entry(&["SECRET"], true, 2, "aal2", ""),
        )]);
        assert!(store.replace_country(CountryCode::FRA, partial).is_err());

        assert_eq!(store.snapshot(), before);
    }
}
