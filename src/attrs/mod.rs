//! Normalizing identity-provider claims.
//!
//! Every federated identity provider asserts subject attributes in its own
//! dialect.  The normalizer maps each dialect onto the canonical attribute
//! set that the rest of the hub (and every peer instance) understands.
//! Normalization never fails on odd input; the only hard requirement is that
//! a stable subject identifier can be derived.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::attrs::clearance::{Clearance, ClearanceStore, Confidence};

pub mod clearance;

//----------- CountryCode ------------------------------------------------------

/// An ISO-3166-1 alpha-3 country code.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CountryCode([u8; 3]);

impl CountryCode {
    pub const USA: CountryCode = CountryCode(*b"USA");
    pub const FRA: CountryCode = CountryCode(*b"FRA");
    pub const CAN: CountryCode = CountryCode(*b"CAN");
    pub const DEU: CountryCode = CountryCode(*b"DEU");
    pub const GBR: CountryCode = CountryCode(*b"GBR");

    pub fn as_str(&self) -> &str {
        // The constructor only admits ASCII uppercase letters.
        std::str::from_utf8(&self.0).unwrap()
    }
}

impl FromStr for CountryCode {
    type Err = InvalidCountry;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Normalize the common alpha-2 spellings to alpha-3.
        let expanded = match s.to_ascii_uppercase().as_str() {
            "US" => "USA",
            "FR" => "FRA",
            "CA" => "CAN",
            "DE" => "DEU",
            "GB" | "UK" => "GBR",
            "AU" => "AUS",
            "NZ" => "NZL",
            "IT" => "ITA",
            "ES" => "ESP",
            "NL" => "NLD",
            "BE" => "BEL",
            "NO" => "NOR",
            "DK" => "DNK",
            "PL" => "POL",
            other => other,
        }
        .to_owned();

        let bytes = expanded.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(InvalidCountry);
        }
        Ok(CountryCode([bytes[0], bytes[1], bytes[2]]))
    }
}

impl fmt::Display for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for CountryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CountryCode({})", self.as_str())
    }
}

impl Serialize for CountryCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for CountryCode {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An error parsing a country code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidCountry;

impl std::error::Error for InvalidCountry {}

impl fmt::Display for InvalidCountry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("not an ISO-3166-1 alpha-3 country code")
    }
}

//----------- UserType ---------------------------------------------------------

/// The category of a federated subject.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserType {
    Military,
    #[default]
    Civilian,
    Contractor,
    Administrator,
}

impl FromStr for UserType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "military" => Ok(UserType::Military),
            "civilian" => Ok(UserType::Civilian),
            "contractor" => Ok(UserType::Contractor),
            "administrator" => Ok(UserType::Administrator),
            _ => Err(()),
        }
    }
}

//----------- SubjectAttributes ------------------------------------------------

/// The canonical attribute set of a federated subject.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAttributes {
    /// A non-empty stable identifier for the subject.
    #[serde(rename = "uniqueID")]
    pub unique_id: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    pub clearance: Clearance,

    /// How the clearance was derived.
    pub clearance_confidence: Confidence,

    pub country_of_affiliation: CountryCode,

    /// Coalition community-of-interest tags.
    #[serde(rename = "acpCOI")]
    pub acp_coi: BTreeSet<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rank: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,

    pub user_type: UserType,

    pub idp_alias: String,
}

//----------- PartialAttributes ------------------------------------------------

/// A partially-populated attribute set awaiting enrichment.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialAttributes {
    #[serde(rename = "uniqueID")]
    pub unique_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub clearance: Option<Clearance>,
    #[serde(default)]
    pub country_of_affiliation: Option<CountryCode>,
    #[serde(default, rename = "acpCOI")]
    pub acp_coi: BTreeSet<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub rank: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub user_type: Option<UserType>,
}

//----------- IdpFamily --------------------------------------------------------

/// The known normalization families.
///
/// The family is derived from the IdP alias prefix exactly once, at the
/// entry point; the rest of the pipeline dispatches on this closed set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdpFamily {
    /// Claims are already canonical (`usa-*`).
    UsaOidc,

    /// French SAML attribute names (`france-*`, `fra-*`).
    FranceSaml,

    /// Mostly canonical with Canadian defaults (`canada-*`, `can-*`).
    CanadaOidc,

    /// Mostly canonical with German defaults (`germany-*`, `deu-*`).
    GermanyOidc,

    /// Industry partners; identity is inferred from the email domain
    /// (`industry-*`).
    Industry,

    /// Anything else: generic pass-through.
    Generic,
}

impl IdpFamily {
    /// Classify an IdP alias.
    pub fn from_alias(alias: &str) -> Self {
        let alias = alias.to_ascii_lowercase();
        if alias.starts_with("usa-") {
            IdpFamily::UsaOidc
        } else if alias.starts_with("france-") || alias.starts_with("fra-") {
            IdpFamily::FranceSaml
        } else if alias.starts_with("canada-") || alias.starts_with("can-") {
            IdpFamily::CanadaOidc
        } else if alias.starts_with("germany-") || alias.starts_with("deu-") {
            IdpFamily::GermanyOidc
        } else if alias.starts_with("industry-") {
            IdpFamily::Industry
        } else {
            IdpFamily::Generic
        }
    }

    /// The country a subject from this family defaults to.
    fn default_country(self) -> Option<CountryCode> {
        match self {
            IdpFamily::UsaOidc => Some(CountryCode::USA),
            IdpFamily::FranceSaml => Some(CountryCode::FRA),
            IdpFamily::CanadaOidc => Some(CountryCode::CAN),
            IdpFamily::GermanyOidc => Some(CountryCode::DEU),
            IdpFamily::Industry | IdpFamily::Generic => None,
        }
    }
}

//----------- Normalizer -------------------------------------------------------

/// Maps raw IdP claims onto [`SubjectAttributes`].
#[derive(Debug)]
pub struct Normalizer {
    clearance: Arc<ClearanceStore>,

    /// Industry clearance ceilings per country.
    industry_caps: Vec<(CountryCode, Clearance)>,

    /// The cap applied to industry subjects from countries not listed above.
    industry_default_cap: Clearance,
}

impl Normalizer {
    pub fn new(clearance: Arc<ClearanceStore>) -> Self {
        Self {
            clearance,
            industry_caps: vec![
                (CountryCode::USA, Clearance::Secret),
                (CountryCode::GBR, Clearance::Secret),
                (CountryCode::CAN, Clearance::Secret),
                (CountryCode::FRA, Clearance::Confidential),
                (CountryCode::DEU, Clearance::Confidential),
            ],
            industry_default_cap: Clearance::Restricted,
        }
    }

    /// Override the industry ceiling for a country.
    pub fn set_industry_cap(&mut self, country: CountryCode, cap: Clearance) {
        if let Some(slot) = self.industry_caps.iter_mut().find(|(c, _)| *c == country) {
            slot.1 = cap;
        } else {
            self.industry_caps.push((country, cap));
        }
    }

    fn industry_cap(&self, country: CountryCode) -> Clearance {
        self.industry_caps
            .iter()
            .find(|(c, _)| *c == country)
            .map(|(_, cap)| *cap)
            .unwrap_or(self.industry_default_cap)
    }

    /// Normalize raw IdP claims.
    ///
    /// Fails only when no stable identifier can be derived from the claims
    /// (checked over `uniqueID`, `preferred_username` and `email`, in that
    /// order, plus the family-specific identifier claims).
    pub fn normalize(
        &self,
        idp_alias: &str,
        claims: &Value,
    ) -> Result<SubjectAttributes, NormalizeError> {
        let family = IdpFamily::from_alias(idp_alias);
        match family {
            IdpFamily::FranceSaml => self.normalize_france(idp_alias, claims),
            IdpFamily::Industry => self.normalize_industry(idp_alias, claims),
            IdpFamily::UsaOidc
            | IdpFamily::CanadaOidc
            | IdpFamily::GermanyOidc
            | IdpFamily::Generic => self.normalize_canonical(idp_alias, family, claims),
        }
    }

    /// Fill in defaults on a partial attribute set.
    ///
    /// Only the identifier must already be present; everything else falls
    /// back to the family defaults (unknown aliases get the minimal set).
    pub fn enrich(&self, partial: PartialAttributes, idp_alias: &str) -> SubjectAttributes {
        let family = IdpFamily::from_alias(idp_alias);
        let (clearance, confidence) = match partial.clearance {
            Some(level) => (level, Confidence::Exact),
            None => (Clearance::Unclassified, Confidence::Fallback),
        };
        SubjectAttributes {
            unique_id: partial.unique_id,
            email: partial.email,
            clearance,
            clearance_confidence: confidence,
            country_of_affiliation: partial
                .country_of_affiliation
                .or_else(|| family.default_country())
                .unwrap_or(CountryCode::USA),
            acp_coi: partial.acp_coi,
            organization: partial.organization,
            rank: partial.rank,
            unit: partial.unit,
            user_type: partial.user_type.unwrap_or_default(),
            idp_alias: idp_alias.to_owned(),
        }
    }

    //--- Family implementations

    /// USA / Canada / Germany OIDC and the generic fallback: claims are
    /// already canonical, only defaults and clearance normalization differ.
    fn normalize_canonical(
        &self,
        idp_alias: &str,
        family: IdpFamily,
        claims: &Value,
    ) -> Result<SubjectAttributes, NormalizeError> {
        let unique_id = derive_unique_id(claims, &[])?;
        let email = claim_str(claims, "email").map(str::to_owned);

        let country = claim_str(claims, "countryOfAffiliation")
            .and_then(|c| c.parse().ok())
            .or_else(|| family.default_country())
            .unwrap_or(CountryCode::USA);

        let (clearance, confidence) = match claim_str(claims, "clearance") {
            Some(term) => match family {
                // The USA family asserts canonical spellings; anything else
                // is silently dropped.
                IdpFamily::UsaOidc | IdpFamily::Generic => match term.parse::<Clearance>() {
                    Ok(level) => (level, Confidence::Exact),
                    Err(_) => (Clearance::Unclassified, Confidence::Fallback),
                },
                // Canadian and German IdPs may assert national terms.
                _ => {
                    let res = self.clearance.normalize(term, country);
                    (res.normalized, res.confidence)
                }
            },
            None => (Clearance::Unclassified, Confidence::Fallback),
        };

        Ok(SubjectAttributes {
            unique_id,
            email,
            clearance,
            clearance_confidence: confidence,
            country_of_affiliation: country,
            acp_coi: claim_list(claims, "acpCOI"),
            organization: claim_str(claims, "organization").map(str::to_owned),
            rank: claim_str(claims, "rank").map(str::to_owned),
            unit: claim_str(claims, "unit").map(str::to_owned),
            user_type: claim_str(claims, "userType")
                .and_then(|s| s.parse().ok())
                .unwrap_or_default(),
            idp_alias: idp_alias.to_owned(),
        })
    }

    /// French SAML attribute names.
    fn normalize_france(
        &self,
        idp_alias: &str,
        claims: &Value,
    ) -> Result<SubjectAttributes, NormalizeError> {
        let unique_id = derive_unique_id(claims, &["uid"])?;
        let email = claim_str(claims, "email")
            .or_else(|| claim_str(claims, "mail"))
            .map(str::to_owned);

        let country = claim_str(claims, "paysAffiliation")
            .and_then(|c| c.parse().ok())
            .unwrap_or(CountryCode::FRA);

        let (clearance, confidence) = match claim_str(claims, "niveauHabilitation") {
            Some(term) => {
                let res = self.clearance.normalize(term, country);
                (res.normalized, res.confidence)
            }
            None => (Clearance::Unclassified, Confidence::Fallback),
        };

        Ok(SubjectAttributes {
            unique_id,
            email,
            clearance,
            clearance_confidence: confidence,
            country_of_affiliation: country,
            acp_coi: claim_list(claims, "groupeInteret"),
            organization: claim_str(claims, "organisation").map(str::to_owned),
            rank: claim_str(claims, "grade").map(str::to_owned),
            unit: claim_str(claims, "unite").map(str::to_owned),
            user_type: claim_str(claims, "userType")
                .and_then(|s| s.parse().ok())
                .unwrap_or(UserType::Military),
            idp_alias: idp_alias.to_owned(),
        })
    }

    /// Industry partners: country and organization come from the email
    /// domain, and the clearance is capped per country.
    fn normalize_industry(
        &self,
        idp_alias: &str,
        claims: &Value,
    ) -> Result<SubjectAttributes, NormalizeError> {
        let unique_id = derive_unique_id(claims, &[])?;
        let email = claim_str(claims, "email").map(str::to_owned);

        let inferred = email.as_deref().and_then(infer_from_domain);
        let country = claim_str(claims, "countryOfAffiliation")
            .and_then(|c| c.parse().ok())
            .or(inferred.map(|(c, _)| c))
            .unwrap_or(CountryCode::USA);
        let organization = claim_str(claims, "organization")
            .map(str::to_owned)
            .or(inferred.map(|(_, org)| org.to_owned()));

        let cap = self.industry_cap(country);
        let (mut clearance, mut confidence) = match claim_str(claims, "clearance") {
            Some(term) => {
                let res = self.clearance.normalize(term, country);
                (res.normalized, res.confidence)
            }
            None => (Clearance::Unclassified, Confidence::Fallback),
        };
        if clearance > cap {
            clearance = cap;
            confidence = Confidence::Mapped;
        }

        Ok(SubjectAttributes {
            unique_id,
            email,
            clearance,
            clearance_confidence: confidence,
            country_of_affiliation: country,
            acp_coi: claim_list(claims, "acpCOI"),
            organization,
            rank: None,
            unit: None,
            user_type: claim_str(claims, "userType")
                .and_then(|s| s.parse().ok())
                .unwrap_or(UserType::Contractor),
            idp_alias: idp_alias.to_owned(),
        })
    }
}

//----------- NormalizeError ---------------------------------------------------

/// An error normalizing IdP claims.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NormalizeError {
    /// No stable identifier could be derived from the claims.
    MissingUniqueId,
}

impl std::error::Error for NormalizeError {}

impl fmt::Display for NormalizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::MissingUniqueId => "no stable subject identifier could be derived",
        })
    }
}

//----------- Claim helpers ----------------------------------------------------

/// Derive the stable identifier using the fallback chain.
///
/// Family-specific identifier claims (e.g. `uid` for French SAML) are
/// consulted first, then `uniqueID`, `preferred_username` and `email`.
fn derive_unique_id(claims: &Value, extra: &[&str]) -> Result<String, NormalizeError> {
    extra
        .iter()
        .copied()
        .chain(["uniqueID", "preferred_username", "email"])
        .find_map(|key| claim_str(claims, key))
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .ok_or(NormalizeError::MissingUniqueId)
}

fn claim_str<'a>(claims: &'a Value, key: &str) -> Option<&'a str> {
    claims.get(key)?.as_str().filter(|s| !s.is_empty())
}

/// Read a claim that may be a string or an array of strings.
fn claim_list(claims: &Value, key: &str) -> BTreeSet<String> {
    match claims.get(key) {
        Some(Value::String(s)) if !s.is_empty() => BTreeSet::from([s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect(),
        _ => BTreeSet::new(),
    }
}

/// Infer (country, organization) from a known industry email domain.
fn infer_from_domain(email: &str) -> Option<(CountryCode, &'static str)> {
    let domain = email.rsplit_once('@')?.1.to_ascii_lowercase();
    let entry = match domain.as_str() {
        "raytheon.com" | "rtx.com" => (CountryCode::USA, "Raytheon"),
        "lockheedmartin.com" | "lmco.com" => (CountryCode::USA, "Lockheed Martin"),
        "boeing.com" => (CountryCode::USA, "Boeing"),
        "northropgrumman.com" | "ngc.com" => (CountryCode::USA, "Northrop Grumman"),
        "thalesgroup.com" => (CountryCode::FRA, "Thales"),
        "airbus.com" => (CountryCode::FRA, "Airbus"),
        "baesystems.com" => (CountryCode::GBR, "BAE Systems"),
        "leonardo.com" => ("ITA".parse().unwrap(), "Leonardo"),
        "rheinmetall.com" => (CountryCode::DEU, "Rheinmetall"),
        "cae.com" => (CountryCode::CAN, "CAE"),
        _ => return None,
    };
    Some(entry)
}

//============ Tests ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn normalizer() -> Normalizer {
        Normalizer::new(Arc::new(ClearanceStore::with_defaults()))
    }

    #[test]
    fn france_saml_attributes() {
        let claims = json!({
            "uid": "pierre.dubois@defense.gouv.fr",
            "niveauHabilitation": "TRÈS_SECRET_DÉFENSE",
            "paysAffiliation": "FRA",
            "groupeInteret": ["NATO-COSMIC", "EU-SECRET"],
            "organisation": "DGA",
            "grade": "Colonel",
        });

        let attrs = normalizer().normalize("france-idp", &claims).unwrap();
        assert_eq!(attrs.unique_id, "pierre.dubois@defense.gouv.fr");
        assert_eq!(attrs.clearance, Clearance::TopSecret);
        assert_eq!(attrs.country_of_affiliation, CountryCode::FRA);
        assert_eq!(
            attrs.acp_coi,
            BTreeSet::from(["NATO-COSMIC".to_owned(), "EU-SECRET".to_owned()])
        );
        assert_eq!(attrs.organization.as_deref(), Some("DGA"));
        assert_eq!(attrs.rank.as_deref(), Some("Colonel"));
    }

    #[test]
    fn industry_clearance_is_capped() {
        let claims = json!({
            "email": "alice@raytheon.com",
            "clearance": "TOP_SECRET",
        });

        let attrs = normalizer().normalize("industry-oidc", &claims).unwrap();
        assert_eq!(attrs.country_of_affiliation, CountryCode::USA);
        assert_eq!(attrs.clearance, Clearance::Secret);
        assert_eq!(attrs.organization.as_deref(), Some("Raytheon"));
        assert_eq!(attrs.user_type, UserType::Contractor);
    }

    #[test]
    fn industry_cap_differs_per_country() {
        let claims = json!({
            "email": "bob@thalesgroup.com",
            "clearance": "TOP_SECRET",
        });

        let attrs = normalizer().normalize("industry-oidc", &claims).unwrap();
        assert_eq!(attrs.country_of_affiliation, CountryCode::FRA);
        assert_eq!(attrs.clearance, Clearance::Confidential);
    }

    #[test]
    fn unique_id_fallback_chain() {
        let n = normalizer();

        let attrs = n
            .normalize("usa-oidc", &json!({"preferred_username": "jdoe"}))
            .unwrap();
        assert_eq!(attrs.unique_id, "jdoe");

        let attrs = n
            .normalize("usa-oidc", &json!({"email": "jdoe@mail.mil"}))
            .unwrap();
        assert_eq!(attrs.unique_id, "jdoe@mail.mil");

        assert_eq!(
            n.normalize("usa-oidc", &json!({"clearance": "SECRET"})),
            Err(NormalizeError::MissingUniqueId)
        );
    }

    #[test]
    fn usa_invalid_clearance_is_dropped() {
        let claims = json!({
            "uniqueID": "jdoe",
            "clearance": "ULTRAVIOLET",
        });

        let attrs = normalizer().normalize("usa-oidc", &claims).unwrap();
        assert_eq!(attrs.clearance, Clearance::Unclassified);
        assert_eq!(attrs.clearance_confidence, Confidence::Fallback);
    }

    #[test]
    fn alpha2_country_is_expanded() {
        let claims = json!({
            "uniqueID": "jdoe",
            "countryOfAffiliation": "US",
        });

        let attrs = normalizer().normalize("usa-oidc", &claims).unwrap();
        assert_eq!(attrs.country_of_affiliation, CountryCode::USA);
    }

    #[test]
    fn germany_national_terms_resolve() {
        let claims = json!({
            "uniqueID": "hmueller",
            "clearance": "GEHEIM",
        });

        let attrs = normalizer().normalize("germany-oidc", &claims).unwrap();
        assert_eq!(attrs.country_of_affiliation, CountryCode::DEU);
        assert_eq!(attrs.clearance, Clearance::Secret);
        assert_eq!(attrs.clearance_confidence, Confidence::Mapped);
    }

    #[test]
    fn unknown_alias_is_generic_passthrough() {
        let claims = json!({
            "uniqueID": "visitor",
            "clearance": "SECRET",
            "countryOfAffiliation": "NOR",
        });

        let attrs = normalizer().normalize("partner-xyz", &claims).unwrap();
        assert_eq!(attrs.clearance, Clearance::Secret);
        assert_eq!(attrs.country_of_affiliation.as_str(), "NOR");
    }

    #[test]
    fn enrich_fills_family_defaults() {
        let partial = PartialAttributes {
            unique_id: "jdoe".into(),
            ..Default::default()
        };
        let attrs = normalizer().enrich(partial, "canada-oidc");
        assert_eq!(attrs.country_of_affiliation, CountryCode::CAN);
        assert_eq!(attrs.clearance, Clearance::Unclassified);
        assert_eq!(attrs.clearance_confidence, Confidence::Fallback);

        // Unknown aliases only get the minimal defaults.
        let partial = PartialAttributes {
            unique_id: "jdoe".into(),
            clearance: Some(Clearance::Secret),
            ..Default::default()
        };
        let attrs = normalizer().enrich(partial, "elsewhere");
        assert_eq!(attrs.clearance, Clearance::Secret);
        assert_eq!(attrs.clearance_confidence, Confidence::Exact);
    }

    #[test]
    fn family_classification() {
        assert_eq!(IdpFamily::from_alias("usa-oidc"), IdpFamily::UsaOidc);
        assert_eq!(IdpFamily::from_alias("france-saml"), IdpFamily::FranceSaml);
        assert_eq!(IdpFamily::from_alias("fra-mindef"), IdpFamily::FranceSaml);
        assert_eq!(IdpFamily::from_alias("canada-oidc"), IdpFamily::CanadaOidc);
        assert_eq!(IdpFamily::from_alias("industry-kc"), IdpFamily::Industry);
        assert_eq!(IdpFamily::from_alias("somewhere"), IdpFamily::Generic);
    }
}
