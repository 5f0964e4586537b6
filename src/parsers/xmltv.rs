use std::io::Cursor;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

#[derive(Debug, Clone, PartialEq)]
pub struct LangText {
    pub lang: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmltvChannel {
    pub id: String,
    pub display_names: Vec<String>,
    pub icons: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmltvProgramme {
    pub start: String,
    pub stop: String,
    pub channel: String,
    pub id: String,
    pub titles: Vec<LangText>,
    pub sub_titles: Vec<LangText>,
    pub descriptions: Vec<LangText>,
    pub categories: Vec<LangText>,
    pub icons: Vec<String>,
}

/// well-formed sources emit channels before programmes but the pipeline
/// must not rely on it, hence one item type for both
#[derive(Debug, Clone, PartialEq)]
pub enum XmltvItem {
    Channel(XmltvChannel),
    Programme(XmltvProgramme),
}

/// streaming decoder over one xmltv document
pub struct XmltvParser {
    reader: Reader<Cursor<Vec<u8>>>,
    buf: Vec<u8>,
}

impl XmltvParser {
    pub fn new(data: Vec<u8>) -> Self {
        let reader = Reader::from_reader(Cursor::new(data));
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    pub fn next_item(&mut self) -> Result<Option<XmltvItem>, String> {
        loop {
            self.buf.clear();
            let start = match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(start)) => match start.name().as_ref() {
                    b"channel" | b"programme" => start.to_owned(),
                    _ => continue,
                },
                Ok(Event::Eof) => return Ok(None),
                Ok(_) => continue,
                Err(e) => return Err(e.to_string()),
            };

            if start.name().as_ref() == b"channel" {
                let channel = self.parse_channel(&start)?;
                return Ok(Some(XmltvItem::Channel(channel)));
            }
            let programme = self.parse_programme(&start)?;
            return Ok(Some(XmltvItem::Programme(programme)));
        }
    }

    fn parse_channel(&mut self, start: &BytesStart) -> Result<XmltvChannel, String> {
        let mut channel = XmltvChannel {
            id: attribute(start, b"id").unwrap_or_default(),
            ..Default::default()
        };

        let mut current: Option<Vec<u8>> = None;
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(e)) => {
                    if e.name().as_ref() == b"icon" {
                        if let Some(src) = attribute(&e, b"src") {
                            channel.icons.push(src);
                        }
                        current = None;
                    } else {
                        current = Some(e.name().as_ref().to_vec());
                    }
                }
                Ok(Event::Empty(e)) => {
                    if e.name().as_ref() == b"icon" {
                        if let Some(src) = attribute(&e, b"src") {
                            channel.icons.push(src);
                        }
                    }
                }
                Ok(Event::Text(text)) => {
                    if current.as_deref() == Some(b"display-name") {
                        let value = text.unescape().map_err(|e| e.to_string())?;
                        let value = value.trim();
                        if !value.is_empty() {
                            channel.display_names.push(value.to_string());
                        }
                    }
                }
                Ok(Event::End(end)) => {
                    if end.name().as_ref() == b"channel" {
                        return Ok(channel);
                    }
                    current = None;
                }
                Ok(Event::Eof) => return Err("unexpected eof inside <channel>".to_string()),
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
    }

    fn parse_programme(&mut self, start: &BytesStart) -> Result<XmltvProgramme, String> {
        let mut programme = XmltvProgramme {
            start: attribute(start, b"start").unwrap_or_default(),
            stop: attribute(start, b"stop").unwrap_or_default(),
            channel: attribute(start, b"channel").unwrap_or_default(),
            id: attribute(start, b"id").unwrap_or_default(),
            ..Default::default()
        };

        let mut current: Option<(Vec<u8>, Option<String>)> = None;
        loop {
            self.buf.clear();
            match self.reader.read_event_into(&mut self.buf) {
                Ok(Event::Start(e)) => {
                    if e.name().as_ref() == b"icon" {
                        if let Some(src) = attribute(&e, b"src") {
                            programme.icons.push(src);
                        }
                        current = None;
                    } else {
                        current = Some((e.name().as_ref().to_vec(), attribute(&e, b"lang")));
                    }
                }
                Ok(Event::Empty(e)) => {
                    if e.name().as_ref() == b"icon" {
                        if let Some(src) = attribute(&e, b"src") {
                            programme.icons.push(src);
                        }
                    }
                }
                Ok(Event::Text(text)) => {
                    if let Some((element, lang)) = &current {
                        let value = text.unescape().map_err(|e| e.to_string())?;
                        let value = value.trim();
                        if value.is_empty() {
                            continue;
                        }
                        let entry = LangText {
                            lang: lang.clone(),
                            value: value.to_string(),
                        };
                        match element.as_slice() {
                            b"title" => programme.titles.push(entry),
                            b"sub-title" => programme.sub_titles.push(entry),
                            b"desc" => programme.descriptions.push(entry),
                            b"category" => programme.categories.push(entry),
                            _ => {}
                        }
                    }
                }
                Ok(Event::End(end)) => {
                    if end.name().as_ref() == b"programme" {
                        return Ok(programme);
                    }
                    current = None;
                }
                Ok(Event::Eof) => return Err("unexpected eof inside <programme>".to_string()),
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }
    }
}

impl Iterator for XmltvParser {
    type Item = Result<XmltvItem, String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_item().transpose()
    }
}

fn attribute(start: &BytesStart, name: &[u8]) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

/// serializes the merged guide back into one xmltv document
pub struct XmltvWriter {
    writer: Writer<Vec<u8>>,
}

impl XmltvWriter {
    pub fn new() -> Self {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        let _ = writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)));
        let mut tv = BytesStart::new("tv");
        tv.push_attribute(("generator-info-name", "tvmux"));
        let _ = writer.write_event(Event::Start(tv));
        Self { writer }
    }

    pub fn write_channel(&mut self, channel: &XmltvChannel) -> Result<(), String> {
        let mut start = BytesStart::new("channel");
        start.push_attribute(("id", channel.id.as_str()));
        self.write(Event::Start(start))?;

        for name in &channel.display_names {
            self.write_text_element("display-name", None, name)?;
        }
        for icon in &channel.icons {
            let mut element = BytesStart::new("icon");
            element.push_attribute(("src", icon.as_str()));
            self.write(Event::Empty(element))?;
        }

        self.write(Event::End(BytesEnd::new("channel")))
    }

    pub fn write_programme(&mut self, programme: &XmltvProgramme) -> Result<(), String> {
        let mut start = BytesStart::new("programme");
        start.push_attribute(("start", programme.start.as_str()));
        if !programme.stop.is_empty() {
            start.push_attribute(("stop", programme.stop.as_str()));
        }
        start.push_attribute(("channel", programme.channel.as_str()));
        if !programme.id.is_empty() {
            start.push_attribute(("id", programme.id.as_str()));
        }
        self.write(Event::Start(start))?;

        for title in &programme.titles {
            self.write_text_element("title", title.lang.as_deref(), &title.value)?;
        }
        for sub_title in &programme.sub_titles {
            self.write_text_element("sub-title", sub_title.lang.as_deref(), &sub_title.value)?;
        }
        for desc in &programme.descriptions {
            self.write_text_element("desc", desc.lang.as_deref(), &desc.value)?;
        }
        for category in &programme.categories {
            self.write_text_element("category", category.lang.as_deref(), &category.value)?;
        }
        for icon in &programme.icons {
            let mut element = BytesStart::new("icon");
            element.push_attribute(("src", icon.as_str()));
            self.write(Event::Empty(element))?;
        }

        self.write(Event::End(BytesEnd::new("programme")))
    }

    pub fn finish(mut self) -> Result<Vec<u8>, String> {
        self.write(Event::End(BytesEnd::new("tv")))?;
        let mut out = self.writer.into_inner();
        out.push(b'\n');
        Ok(out)
    }

    fn write_text_element(
        &mut self,
        name: &str,
        lang: Option<&str>,
        value: &str,
    ) -> Result<(), String> {
        let mut start = BytesStart::new(name);
        if let Some(lang) = lang {
            start.push_attribute(("lang", lang));
        }
        self.write(Event::Start(start))?;
        self.write(Event::Text(BytesText::new(value)))?;
        self.write(Event::End(BytesEnd::new(name)))
    }

    fn write(&mut self, event: Event) -> Result<(), String> {
        self.writer.write_event(event).map_err(|e| e.to_string())
    }
}

impl Default for XmltvWriter {
    fn default() -> Self {
        Self::new()
    }
}
