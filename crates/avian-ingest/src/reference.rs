//! Static reference tables used by transforms
//!
//! Lookups are case-insensitive and never fail: callers decide whether an
//! unknown value passes through verbatim or maps to an empty code.

/// A species on the USUV watch list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Species {
    pub scientific: &'static str,
    pub common: &'static str,
    pub dutch: &'static str,
    pub ebird_code: &'static str,
}

/// USUV-susceptible species, most frequently affected first
pub const USUV_SPECIES: &[Species] = &[
    Species { scientific: "Turdus merula", common: "Eurasian Blackbird", dutch: "Merel", ebird_code: "eurbla" },
    Species { scientific: "Turdus philomelos", common: "Song Thrush", dutch: "Zanglijster", ebird_code: "sonthr1" },
    Species { scientific: "Turdus viscivorus", common: "Mistle Thrush", dutch: "Grote lijster", ebird_code: "misthr1" },
    Species { scientific: "Pica pica", common: "Eurasian Magpie", dutch: "Ekster", ebird_code: "eurmag1" },
    Species { scientific: "Garrulus glandarius", common: "Eurasian Jay", dutch: "Vlaamse gaai", ebird_code: "eurjay1" },
    Species { scientific: "Chloris chloris", common: "European Greenfinch", dutch: "Groenling", ebird_code: "eurgre1" },
    Species { scientific: "Sturnus vulgaris", common: "European Starling", dutch: "Spreeuw", ebird_code: "eursta" },
    Species { scientific: "Corvus corone", common: "Carrion Crow", dutch: "Zwarte kraai", ebird_code: "carcro1" },
    Species { scientific: "Cyanistes caeruleus", common: "Eurasian Blue Tit", dutch: "Pimpelmees", ebird_code: "eurbtt1" },
    Species { scientific: "Parus major", common: "Great Tit", dutch: "Koolmees", ebird_code: "gretit1" },
];

/// Find a watch-list species by scientific, English or Dutch name
pub fn find_species(name: &str) -> Option<&'static Species> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    USUV_SPECIES.iter().find(|s| {
        s.scientific.eq_ignore_ascii_case(name)
            || s.common.eq_ignore_ascii_case(name)
            || s.dutch.eq_ignore_ascii_case(name)
    })
}

/// eBird code for any known name of a watch-list species
pub fn species_code_for(name: &str) -> Option<&'static str> {
    find_species(name).map(|s| s.ebird_code)
}

pub fn is_usuv_species_code(code: &str) -> bool {
    USUV_SPECIES.iter().any(|s| s.ebird_code.eq_ignore_ascii_case(code.trim()))
}

/// Two-letter province code to name
pub const DUTCH_PROVINCES: &[(&str, &str)] = &[
    ("DR", "Drenthe"),
    ("FL", "Flevoland"),
    ("FR", "Friesland"),
    ("GE", "Gelderland"),
    ("GR", "Groningen"),
    ("LI", "Limburg"),
    ("NB", "Noord-Brabant"),
    ("NH", "Noord-Holland"),
    ("OV", "Overijssel"),
    ("UT", "Utrecht"),
    ("ZE", "Zeeland"),
    ("ZH", "Zuid-Holland"),
];

pub fn province_name(code: &str) -> Option<&'static str> {
    let code = code.trim();
    DUTCH_PROVINCES
        .iter()
        .find(|(c, _)| c.eq_ignore_ascii_case(code))
        .map(|(_, name)| *name)
}

/// Lab result code to positive/negative; untested and inconclusive are `None`
pub fn usuv_result(code: &str) -> Option<bool> {
    match code.trim().to_ascii_uppercase().as_str() {
        "POS" | "POSITIVE" => Some(true),
        "NEG" | "NEGATIVE" => Some(false),
        _ => None,
    }
}

/// Whether a `usuv_tested` cell indicates the bird was tested
pub fn usuv_tested(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_uppercase().as_str(),
        "YES" | "TRUE" | "1" | "POS" | "NEG" | "POSITIVE" | "NEGATIVE"
    )
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeatherStation {
    pub id: &'static str,
    pub name: &'static str,
    pub lat: f64,
    pub lon: f64,
    pub province: &'static str,
}

/// KNMI reference stations
pub const KNMI_STATIONS: &[WeatherStation] = &[
    WeatherStation { id: "260", name: "De Bilt", lat: 52.10, lon: 5.18, province: "Utrecht" },
    WeatherStation { id: "240", name: "Schiphol", lat: 52.30, lon: 4.77, province: "Noord-Holland" },
    WeatherStation { id: "344", name: "Rotterdam", lat: 51.96, lon: 4.45, province: "Zuid-Holland" },
    WeatherStation { id: "370", name: "Eindhoven", lat: 51.45, lon: 5.42, province: "Noord-Brabant" },
    WeatherStation { id: "380", name: "Maastricht", lat: 50.91, lon: 5.77, province: "Limburg" },
    WeatherStation { id: "270", name: "Leeuwarden", lat: 53.22, lon: 5.75, province: "Friesland" },
    WeatherStation { id: "280", name: "Eelde", lat: 53.13, lon: 6.58, province: "Groningen" },
    WeatherStation { id: "290", name: "Twenthe", lat: 52.27, lon: 6.90, province: "Overijssel" },
    WeatherStation { id: "375", name: "Volkel", lat: 51.66, lon: 5.71, province: "Noord-Brabant" },
    WeatherStation { id: "350", name: "Gilze-Rijen", lat: 51.57, lon: 4.93, province: "Noord-Brabant" },
];

pub fn knmi_station(id: &str) -> Option<&'static WeatherStation> {
    let id = id.trim();
    KNMI_STATIONS.iter().find(|s| s.id == id)
}
