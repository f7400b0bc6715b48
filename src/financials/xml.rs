use quick_xml::{Reader, events::Event};

/// Flattened view of a Trading API response: every text node keyed by its
/// element path (`GetItemResponse/Item/SellingStatus/CurrentPrice`).
#[derive(Debug, Default)]
pub struct XmlDoc {
    nodes: Vec<(String, String)>,
}

impl XmlDoc {
    pub fn parse(raw: &str) -> Result<Self, quick_xml::Error> {
        let mut reader = Reader::from_str(raw);
        reader.config_mut().trim_text(true);

        let mut stack: Vec<String> = Vec::new();
        let mut nodes = Vec::new();
        loop {
            match reader.read_event()? {
                Event::Start(start) => {
                    stack.push(String::from_utf8_lossy(start.local_name().as_ref()).into_owned());
                }
                Event::End(_) => {
                    stack.pop();
                }
                Event::Text(text) => {
                    let value = text.unescape()?;
                    if !value.is_empty() {
                        nodes.push((stack.join("/"), value.into_owned()));
                    }
                }
                Event::CData(data) => {
                    let value = String::from_utf8_lossy(&data.into_inner()).into_owned();
                    nodes.push((stack.join("/"), value));
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(Self { nodes })
    }

    /// Text values whose path ends with `suffix`, in document order.
    pub fn all<'a>(&'a self, suffix: &str) -> impl Iterator<Item = &'a str> {
        self.nodes
            .iter()
            .filter(move |(path, _)| path_matches(path, suffix))
            .map(|(_, value)| value.as_str())
    }

    pub fn first(&self, suffix: &str) -> Option<&str> {
        self.all(suffix).next()
    }

    pub fn first_f64(&self, suffix: &str) -> Option<f64> {
        self.first(suffix).and_then(|value| value.trim().parse().ok())
    }

    pub fn sum_f64(&self, suffix: &str) -> f64 {
        self.all(suffix)
            .filter_map(|value| value.trim().parse::<f64>().ok())
            .sum()
    }

    /// `Ack` of `Success` or `Warning`.
    pub fn is_success(&self) -> bool {
        matches!(self.first("Ack"), Some("Success") | Some("Warning"))
    }

    pub fn error_message(&self) -> Option<&str> {
        self.first("Errors/LongMessage")
            .or_else(|| self.first("Errors/ShortMessage"))
    }
}

fn path_matches(path: &str, suffix: &str) -> bool {
    path.strip_suffix(suffix)
        .is_some_and(|head| head.is_empty() || head.ends_with('/'))
}
