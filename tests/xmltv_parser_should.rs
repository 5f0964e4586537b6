// guide decoding and re-encoding
use tvmux::parsers::xmltv::{XmltvItem, XmltvParser, XmltvWriter};

const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv generator-info-name="upstream">
  <channel id="cnn.us">
    <display-name lang="en">CNN</display-name>
    <display-name>CNN International</display-name>
    <icon src="http://upstream/logos/cnn.png"/>
  </channel>
  <programme start="20260801200000 +0000" stop="20260801210000 +0000" channel="cnn.us">
    <title lang="en">Evening News</title>
    <desc lang="en">Headlines &amp; analysis</desc>
    <category>News</category>
    <icon src="http://upstream/stills/news.jpg"/>
  </programme>
</tv>
"#;

fn parse_all(raw: &str) -> Vec<XmltvItem> {
    XmltvParser::new(raw.as_bytes().to_vec())
        .collect::<Result<Vec<_>, _>>()
        .unwrap()
}

#[test]
fn test_parses_channels_and_programmes() {
    let items = parse_all(SAMPLE);
    assert_eq!(items.len(), 2);

    let XmltvItem::Channel(channel) = &items[0] else {
        panic!("expected a channel first");
    };
    assert_eq!(channel.id, "cnn.us");
    assert_eq!(channel.display_names, vec!["CNN", "CNN International"]);
    assert_eq!(channel.icons, vec!["http://upstream/logos/cnn.png"]);

    let XmltvItem::Programme(programme) = &items[1] else {
        panic!("expected a programme second");
    };
    assert_eq!(programme.channel, "cnn.us");
    assert_eq!(programme.start, "20260801200000 +0000");
    assert_eq!(programme.titles[0].value, "Evening News");
    assert_eq!(programme.titles[0].lang.as_deref(), Some("en"));
    assert_eq!(programme.descriptions[0].value, "Headlines & analysis");
    assert_eq!(programme.categories[0].value, "News");
    assert_eq!(programme.icons, vec!["http://upstream/stills/news.jpg"]);
}

#[test]
fn test_programmes_before_channels_still_parse() {
    let raw = r#"<tv>
  <programme start="1" channel="x"><title>Early</title></programme>
  <channel id="x"><display-name>X</display-name></channel>
</tv>"#;

    let items = parse_all(raw);
    assert!(matches!(items[0], XmltvItem::Programme(_)));
    assert!(matches!(items[1], XmltvItem::Channel(_)));
}

#[test]
fn test_truncated_document_is_an_error() {
    let raw = "<tv><channel id=\"x\"><display-name>X</display-name>";
    let result: Result<Vec<_>, _> = XmltvParser::new(raw.as_bytes().to_vec()).collect();
    assert!(result.is_err());
}

#[test]
fn test_writer_round_trip() {
    let items = parse_all(SAMPLE);

    let mut writer = XmltvWriter::new();
    for item in &items {
        match item {
            XmltvItem::Channel(channel) => writer.write_channel(channel).unwrap(),
            XmltvItem::Programme(programme) => writer.write_programme(programme).unwrap(),
        }
    }
    let out = writer.finish().unwrap();
    let out_text = String::from_utf8(out.clone()).unwrap();

    assert!(out_text.contains("<tv generator-info-name=\"tvmux\">"));
    assert!(out_text.contains("channel id=\"cnn.us\""));
    assert!(out_text.contains("start=\"20260801200000 +0000\""));
    // escaping survives the round trip
    assert!(out_text.contains("Headlines &amp; analysis"));

    let reparsed = XmltvParser::new(out)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(&items, &reparsed);
}
