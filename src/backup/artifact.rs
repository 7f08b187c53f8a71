use std::fmt;

/// Encoding stages a modifier can leave in an artifact name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Gzip,
    Gpg,
}

impl Codec {
    pub fn suffix(&self) -> &'static str {
        match self {
            Codec::Gzip => ".gz",
            Codec::Gpg => ".gpg",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        [Codec::Gzip, Codec::Gpg]
            .into_iter()
            .find(|c| c.suffix() == suffix)
    }
}

/// Name of a stored artifact: the source's base name plus one suffix per
/// applied modifier, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    base: String,
    codecs: Vec<Codec>,
}

impl ArtifactName {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            codecs: Vec::new(),
        }
    }

    /// Recovers the codec chain from a stored name.
    pub fn parse(name: &str) -> Self {
        let mut base = name;
        let mut codecs = Vec::new();
        while let Some(dot) = base.rfind('.') {
            match Codec::from_suffix(&base[dot..]) {
                Some(codec) => {
                    codecs.push(codec);
                    base = &base[..dot];
                }
                None => break,
            }
        }
        codecs.reverse();
        Self {
            base: base.to_string(),
            codecs,
        }
    }

    pub fn push(&mut self, codec: Codec) {
        self.codecs.push(codec);
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    /// Codecs in the order they were applied.
    pub fn codecs(&self) -> &[Codec] {
        &self.codecs
    }

    /// Codecs in the order a restore has to undo them.
    pub fn decode_pipeline(&self) -> impl Iterator<Item = Codec> + '_ {
        self.codecs.iter().rev().copied()
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.base)?;
        for codec in &self.codecs {
            f.write_str(codec.suffix())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suffixes_follow_application_order() {
        let mut name = ArtifactName::new("host/daily/mysql/mysql-2017-03-20_03_11_13.xbstream");
        name.push(Codec::Gzip);
        name.push(Codec::Gpg);
        assert_eq!(
            name.to_string(),
            "host/daily/mysql/mysql-2017-03-20_03_11_13.xbstream.gz.gpg"
        );
        assert_eq!(
            name.decode_pipeline().collect::<Vec<_>>(),
            vec![Codec::Gpg, Codec::Gzip]
        );
    }

    #[test]
    fn test_parse_recovers_chain() {
        for applied in [
            vec![],
            vec![Codec::Gzip],
            vec![Codec::Gzip, Codec::Gpg],
            vec![Codec::Gpg, Codec::Gzip],
        ] {
            let mut name = ArtifactName::new("host/hourly/files/_etc-2024.tar");
            for codec in &applied {
                name.push(*codec);
            }
            let parsed = ArtifactName::parse(&name.to_string());
            assert_eq!(parsed, name);
            assert_eq!(parsed.codecs(), applied.as_slice());
        }
    }

    #[test]
    fn test_parse_keeps_unknown_extensions_in_base() {
        let parsed = ArtifactName::parse("dump.sql.gz");
        assert_eq!(parsed.base(), "dump.sql");
        assert_eq!(parsed.codecs(), &[Codec::Gzip]);
    }
}
