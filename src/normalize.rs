use crate::config::NormalizeSettings;

/// Turns free-text shipping addresses into the short form used as cache key.
///
/// Every configured marker is removed (repeatedly, so removals cannot splice a
/// new marker together), the text is cut at the first delimiter and trimmed.
/// The output never contains a marker or a delimiter, so normalizing twice is
/// the same as normalizing once.
#[derive(Debug, Clone)]
pub struct AddressNormalizer {
    markers: Vec<String>,
    delimiter: char,
}

impl Default for AddressNormalizer {
    fn default() -> Self {
        Self::from_settings(&NormalizeSettings::default())
    }
}

impl AddressNormalizer {
    pub fn new<I, S>(markers: I, delimiter: char) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            markers: markers
                .into_iter()
                .map(Into::into)
                .filter(|marker: &String| !marker.is_empty())
                .collect(),
            delimiter,
        }
    }

    pub fn from_settings(settings: &NormalizeSettings) -> Self {
        Self::new(settings.markers.iter().cloned(), settings.delimiter)
    }

    pub fn normalize(&self, raw: &str) -> String {
        let mut cleaned = raw.to_string();
        loop {
            let before = cleaned.len();
            for marker in &self.markers {
                if cleaned.contains(marker.as_str()) {
                    cleaned = cleaned.replace(marker.as_str(), "");
                }
            }
            if cleaned.len() == before {
                break;
            }
        }

        cleaned
            .split(self.delimiter)
            .next()
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contains_marker(normalizer: &AddressNormalizer, value: &str) -> bool {
        normalizer
            .markers
            .iter()
            .any(|marker| value.contains(marker.as_str()))
    }

    #[test]
    fn strips_markers_and_truncates() {
        let normalizer = AddressNormalizer::default();
        assert_eq!(normalizer.normalize("A, city"), "A");
        assert_eq!(normalizer.normalize("Point 192 - B"), "B");
        assert_eq!(
            normalizer.normalize("Jumia- Pargo- Pickup station - Maadi Branch, Cairo, Egypt"),
            "Maadi Branch"
        );
        assert_eq!(normalizer.normalize("   Heliopolis   "), "Heliopolis");
    }

    #[test]
    fn empty_input_yields_empty_string() {
        let normalizer = AddressNormalizer::default();
        assert_eq!(normalizer.normalize(""), "");
        assert_eq!(normalizer.normalize(" , leading comma"), "");
    }

    #[test]
    fn removal_cannot_reassemble_a_marker() {
        let normalizer = AddressNormalizer::new(["Point 192 -"], ',');
        let spliced = "PoiPoint 192 -nt 192 - Nasr City";
        let cleaned = normalizer.normalize(spliced);
        assert!(!contains_marker(&normalizer, &cleaned));
        assert_eq!(cleaned, "Nasr City");
    }

    #[test]
    fn normalization_is_idempotent() {
        let normalizer = AddressNormalizer::default();
        let samples = [
            "A, city",
            "Point 192 - B",
            "Jumia- Pargo- Pickup station -Point 192 - Zamalek, Cairo",
            "  no delimiter at all  ",
            ",,,",
            "Point 192 -Point 192 -",
            "Ünïcödé street 5, Alexandria",
        ];
        for sample in samples {
            let once = normalizer.normalize(sample);
            assert_eq!(normalizer.normalize(&once), once, "sample {sample:?}");
            assert!(!contains_marker(&normalizer, &once));
            assert!(!once.contains(','));
        }
    }

    #[test]
    fn honours_custom_delimiter_and_ignores_empty_markers() {
        let normalizer = AddressNormalizer::new(["", "PICKUP:"], ';');
        assert_eq!(normalizer.normalize("PICKUP: Dokki; Giza, Egypt"), "Dokki");
    }
}
