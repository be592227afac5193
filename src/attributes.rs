use regex::{Regex, RegexBuilder};

use crate::domain::{Author, WorkAttributes, normalize_doi, normalize_pmcid, normalize_pmid};
use crate::error::IngestError;
use crate::xml::{XmlContent, XmlNode};

pub const RESOURCE_TYPE: &str = "Article";

/// Turns one source-specific metadata document into `WorkAttributes`.
pub trait AttributeBuilder {
    fn title(&self) -> Option<String>;
    fn abstract_text(&self) -> Option<String>;
    fn generate_authors(&self) -> Vec<Author>;
    fn set_identifiers(&self, attrs: &mut WorkAttributes);
    fn set_journal_attributes(&self, attrs: &mut WorkAttributes);
    fn get_date_issued(&self) -> Option<String>;
    fn keywords(&self) -> Vec<String>;
    fn funders(&self) -> Vec<String>;
    fn language(&self) -> Option<String>;

    fn build(&self, admin_set_title: &str, depositor: &str) -> Result<WorkAttributes, IngestError> {
        let title = self
            .title()
            .ok_or_else(|| IngestError::Xml("document has no article title".to_string()))?;
        let mut attrs = WorkAttributes {
            title,
            abstract_text: self.abstract_text(),
            authors: self.generate_authors(),
            date_issued: self.get_date_issued(),
            keywords: self.keywords(),
            funders: self.funders(),
            language: self.language(),
            resource_type: RESOURCE_TYPE.to_string(),
            admin_set_title: Some(admin_set_title.to_string()),
            depositor: Some(depositor.to_string()),
            ..WorkAttributes::default()
        };
        self.set_identifiers(&mut attrs);
        self.set_journal_attributes(&mut attrs);
        attrs.refresh_identifier_list();
        Ok(attrs)
    }
}

/// Picks the builder for a document by its root element name.
pub fn builder_for(document: &XmlNode) -> Option<Box<dyn AttributeBuilder + '_>> {
    match document.name.as_str() {
        "PubmedArticle" => Some(Box::new(PubmedAttributeBuilder::new(document))),
        "article" => Some(Box::new(PmcAttributeBuilder::new(document))),
        _ => None,
    }
}

/// `PubmedArticle` records from `efetch.fcgi?db=pubmed`.
pub struct PubmedAttributeBuilder<'a> {
    root: &'a XmlNode,
}

impl<'a> PubmedAttributeBuilder<'a> {
    pub fn new(root: &'a XmlNode) -> Self {
        Self { root }
    }

    fn article(&self) -> Option<&'a XmlNode> {
        self.root.find("MedlineCitation/Article")
    }

    fn article_id(&self, id_type: &str) -> Option<String> {
        self.root
            .find_all("PubmedData/ArticleIdList/ArticleId")
            .into_iter()
            .find(|node| node.attr("IdType") == Some(id_type))
            .map(XmlNode::text)
            .filter(|text| !text.is_empty())
    }
}

impl AttributeBuilder for PubmedAttributeBuilder<'_> {
    fn title(&self) -> Option<String> {
        self.article()?.find_text("ArticleTitle")
    }

    fn abstract_text(&self) -> Option<String> {
        let sections = self
            .article()?
            .find_all("Abstract/AbstractText")
            .into_iter()
            .filter_map(|node| {
                let text = node.text();
                if text.is_empty() {
                    return None;
                }
                Some(match node.attr("Label") {
                    Some(label) => format!("{label}: {text}"),
                    None => text,
                })
            })
            .collect::<Vec<_>>();
        (!sections.is_empty()).then(|| sections.join("\n"))
    }

    fn generate_authors(&self) -> Vec<Author> {
        let Some(article) = self.article() else {
            return Vec::new();
        };
        article
            .find_all("AuthorList/Author")
            .into_iter()
            .filter_map(|node| {
                let family = node.find_text("LastName");
                let given = node.find_text("ForeName").or_else(|| node.find_text("Initials"));
                let name = match (&family, &given) {
                    (Some(family), Some(given)) => format!("{family}, {given}"),
                    (Some(family), None) => family.clone(),
                    _ => node.find_text("CollectiveName")?,
                };
                let orcid = node
                    .children_named("Identifier")
                    .find(|id| id.attr("Source") == Some("ORCID"))
                    .map(|id| normalize_orcid(&id.text()));
                let affiliations = node
                    .find_all("AffiliationInfo/Affiliation")
                    .into_iter()
                    .map(XmlNode::text)
                    .filter(|text| !text.is_empty())
                    .collect::<Vec<_>>();
                Some((name, given, family, orcid, affiliations))
            })
            .enumerate()
            .map(|(index, (name, given_name, family_name, orcid, affiliations))| Author {
                name,
                given_name,
                family_name,
                orcid,
                affiliations,
                index,
            })
            .collect()
    }

    fn set_identifiers(&self, attrs: &mut WorkAttributes) {
        attrs.pmid = self
            .root
            .find_text("MedlineCitation/PMID")
            .or_else(|| self.article_id("pubmed"))
            .and_then(|value| normalize_pmid(&value));
        attrs.pmcid = self
            .article_id("pmc")
            .and_then(|value| normalize_pmcid(&value));
        attrs.doi = self
            .article_id("doi")
            .or_else(|| {
                self.article()?
                    .children_named("ELocationID")
                    .find(|node| node.attr("EIdType") == Some("doi"))
                    .map(XmlNode::text)
            })
            .and_then(|value| normalize_doi(&value));
    }

    fn set_journal_attributes(&self, attrs: &mut WorkAttributes) {
        let Some(article) = self.article() else {
            return;
        };
        if let Some(journal) = article.child("Journal") {
            attrs.journal_title = journal.find_text("Title");
            attrs.journal_volume = journal.find_text("JournalIssue/Volume");
            attrs.journal_issue = journal.find_text("JournalIssue/Issue");
            attrs.issn = journal
                .children_named("ISSN")
                .map(XmlNode::text)
                .filter(|text| !text.is_empty())
                .collect();
        }
        attrs.page_start = article.find_text("Pagination/StartPage");
        attrs.page_end = article.find_text("Pagination/EndPage");
        if attrs.page_start.is_none() {
            if let Some(pages) = article.find_text("Pagination/MedlinePgn") {
                let (start, end) = split_page_range(&pages);
                attrs.page_start = start;
                attrs.page_end = end;
            }
        }
    }

    fn get_date_issued(&self) -> Option<String> {
        let article = self.article()?;
        let pub_date = article.find("Journal/JournalIssue/PubDate");
        if let Some(date) = pub_date.and_then(date_from_parts) {
            return Some(date);
        }
        if let Some(medline) = pub_date.and_then(|node| node.find_text("MedlineDate")) {
            return parse_medline_date(&medline);
        }
        article
            .children_named("ArticleDate")
            .find_map(date_from_parts)
    }

    fn keywords(&self) -> Vec<String> {
        self.root
            .find_all("MedlineCitation/KeywordList/Keyword")
            .into_iter()
            .map(XmlNode::text)
            .filter(|text| !text.is_empty())
            .collect()
    }

    fn funders(&self) -> Vec<String> {
        let Some(article) = self.article() else {
            return Vec::new();
        };
        dedup_preserving_order(
            article
                .find_all("GrantList/Grant/Agency")
                .into_iter()
                .map(XmlNode::text),
        )
    }

    fn language(&self) -> Option<String> {
        self.article()?.find_text("Language")
    }
}

/// JATS `article` documents from `efetch.fcgi?db=pmc`.
pub struct PmcAttributeBuilder<'a> {
    root: &'a XmlNode,
}

impl<'a> PmcAttributeBuilder<'a> {
    pub fn new(root: &'a XmlNode) -> Self {
        Self { root }
    }

    fn meta(&self) -> Option<&'a XmlNode> {
        self.root.find("front/article-meta")
    }

    fn journal_meta(&self) -> Option<&'a XmlNode> {
        self.root.find("front/journal-meta")
    }

    fn article_id(&self, types: &[&str]) -> Option<String> {
        self.meta()?
            .children_named("article-id")
            .find(|node| {
                node.attr("pub-id-type")
                    .is_some_and(|kind| types.contains(&kind))
            })
            .map(XmlNode::text)
            .filter(|text| !text.is_empty())
    }

    fn affiliation(&self, id: &str) -> Option<String> {
        self.meta()?
            .descendants("aff")
            .into_iter()
            .find(|aff| aff.attr("id") == Some(id))
            .map(affiliation_text)
            .filter(|text| !text.is_empty())
    }
}

impl AttributeBuilder for PmcAttributeBuilder<'_> {
    fn title(&self) -> Option<String> {
        self.meta()?.find_text("title-group/article-title")
    }

    fn abstract_text(&self) -> Option<String> {
        let node = self.meta()?.child("abstract")?;
        let paragraphs = node
            .descendants("p")
            .into_iter()
            .map(XmlNode::text)
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>();
        if paragraphs.is_empty() {
            Some(node.text()).filter(|text| !text.is_empty())
        } else {
            Some(paragraphs.join("\n"))
        }
    }

    fn generate_authors(&self) -> Vec<Author> {
        let Some(meta) = self.meta() else {
            return Vec::new();
        };
        meta.find_all("contrib-group/contrib")
            .into_iter()
            .filter(|contrib| contrib.attr("contrib-type").is_none_or(|kind| kind == "author"))
            .filter_map(|contrib| {
                let family = contrib.find_text("name/surname");
                let given = contrib.find_text("name/given-names");
                let name = match (&family, &given) {
                    (Some(family), Some(given)) => format!("{family}, {given}"),
                    (Some(family), None) => family.clone(),
                    _ => contrib.find_text("collab")?,
                };
                let orcid = contrib
                    .children_named("contrib-id")
                    .find(|id| id.attr("contrib-id-type") == Some("orcid"))
                    .map(|id| normalize_orcid(&id.text()));

                let mut affiliations = contrib
                    .children_named("xref")
                    .filter(|xref| xref.attr("ref-type") == Some("aff"))
                    .filter_map(|xref| xref.attr("rid"))
                    .flat_map(|rids| rids.split_whitespace())
                    .filter_map(|rid| self.affiliation(rid))
                    .collect::<Vec<_>>();
                affiliations.extend(
                    contrib
                        .children_named("aff")
                        .map(affiliation_text)
                        .filter(|text| !text.is_empty()),
                );
                Some((name, given, family, orcid, affiliations))
            })
            .enumerate()
            .map(|(index, (name, given_name, family_name, orcid, affiliations))| Author {
                name,
                given_name,
                family_name,
                orcid,
                affiliations: dedup_preserving_order(affiliations.into_iter()),
                index,
            })
            .collect()
    }

    fn set_identifiers(&self, attrs: &mut WorkAttributes) {
        attrs.pmid = self
            .article_id(&["pmid"])
            .and_then(|value| normalize_pmid(&value));
        attrs.pmcid = self
            .article_id(&["pmc", "pmcid", "pmcaid"])
            .and_then(|value| normalize_pmcid(&value));
        attrs.doi = self
            .article_id(&["doi"])
            .and_then(|value| normalize_doi(&value));
    }

    fn set_journal_attributes(&self, attrs: &mut WorkAttributes) {
        if let Some(journal) = self.journal_meta() {
            attrs.journal_title = journal
                .find_text("journal-title-group/journal-title")
                .or_else(|| journal.find_text("journal-title"));
            attrs.issn = journal
                .children_named("issn")
                .map(XmlNode::text)
                .filter(|text| !text.is_empty())
                .collect();
            attrs.publisher = journal.find_text("publisher/publisher-name");
        }
        if let Some(meta) = self.meta() {
            attrs.journal_volume = meta.find_text("volume");
            attrs.journal_issue = meta.find_text("issue");
            attrs.page_start = meta.find_text("fpage");
            attrs.page_end = meta.find_text("lpage");
        }
    }

    fn get_date_issued(&self) -> Option<String> {
        let dates = self.meta()?.children_named("pub-date").collect::<Vec<_>>();
        for preferred in ["epub", "electronic", "ppub", "print", "collection"] {
            if let Some(date) = dates
                .iter()
                .copied()
                .filter(|node| pub_date_kind(node) == preferred)
                .find_map(jats_date)
            {
                return Some(date);
            }
        }
        dates.into_iter().find_map(jats_date)
    }

    fn keywords(&self) -> Vec<String> {
        let Some(meta) = self.meta() else {
            return Vec::new();
        };
        meta.find_all("kwd-group/kwd")
            .into_iter()
            .map(XmlNode::text)
            .filter(|text| !text.is_empty())
            .collect()
    }

    fn funders(&self) -> Vec<String> {
        let Some(meta) = self.meta() else {
            return Vec::new();
        };
        dedup_preserving_order(
            meta.find_all("funding-group/award-group/funding-source")
                .into_iter()
                .map(XmlNode::text),
        )
    }

    fn language(&self) -> Option<String> {
        self.root
            .attr("xml:lang")
            .map(str::to_string)
            .filter(|lang| !lang.is_empty())
    }
}

/// Case-insensitive match of author affiliations against configured
/// institution name variants. Runs of whitespace in a variant match any
/// whitespace.
#[derive(Debug, Clone)]
pub struct AffiliationMatcher {
    pattern: Option<Regex>,
}

impl AffiliationMatcher {
    pub fn new(variants: &[String]) -> Result<Self, IngestError> {
        let alternatives = variants
            .iter()
            .map(|variant| {
                variant
                    .split_whitespace()
                    .map(regex::escape)
                    .collect::<Vec<_>>()
                    .join(r"\s+")
            })
            .filter(|alt| !alt.is_empty())
            .collect::<Vec<_>>();
        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }
        let pattern = RegexBuilder::new(&alternatives.join("|"))
            .case_insensitive(true)
            .build()
            .map_err(|err| IngestError::ConfigParse(format!("affiliation_variants: {err}")))?;
        Ok(Self {
            pattern: Some(pattern),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.pattern.is_some()
    }

    pub fn matches_text(&self, affiliation: &str) -> bool {
        self.pattern
            .as_ref()
            .is_none_or(|pattern| pattern.is_match(affiliation))
    }

    /// True when the filter is disabled or any author affiliation matches.
    pub fn matches(&self, attrs: &WorkAttributes) -> bool {
        match &self.pattern {
            None => true,
            Some(pattern) => attrs.affiliations().any(|aff| pattern.is_match(aff)),
        }
    }
}

fn normalize_orcid(value: &str) -> String {
    let trimmed = value.trim();
    for prefix in ["https://orcid.org/", "http://orcid.org/"] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            return format!("https://orcid.org/{rest}");
        }
    }
    format!("https://orcid.org/{trimmed}")
}

/// Text of an `aff` element without its `label` marker.
fn affiliation_text(aff: &XmlNode) -> String {
    let mut parts = Vec::new();
    for item in &aff.content {
        match item {
            XmlContent::Text(text) => parts.push(text.clone()),
            XmlContent::Element(node) if node.name == "label" => {}
            XmlContent::Element(node) => parts.push(node.text()),
        }
    }
    parts
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_start_matches([',', ';'])
        .trim()
        .to_string()
}

fn pub_date_kind(node: &XmlNode) -> &str {
    node.attr("pub-type")
        .or_else(|| node.attr("publication-format"))
        .unwrap_or_default()
}

fn date_from_parts(node: &XmlNode) -> Option<String> {
    let year = node.find_text("Year").filter(|y| is_year(y))?;
    let month = node.find_text("Month").and_then(|m| parse_month(&m));
    let day = node.find_text("Day").and_then(|d| parse_day(&d));
    Some(format_date(&year, month, day))
}

fn jats_date(node: &XmlNode) -> Option<String> {
    let year = node.find_text("year").filter(|y| is_year(y))?;
    let month = node.find_text("month").and_then(|m| parse_month(&m));
    let day = node.find_text("day").and_then(|d| parse_day(&d));
    Some(format_date(&year, month, day))
}

/// `MedlineDate` values look like `2019 Nov-Dec` or `1998 Dec-1999 Jan`.
fn parse_medline_date(value: &str) -> Option<String> {
    let mut parts = value.split_whitespace();
    let year = parts.next().filter(|y| is_year(y))?;
    let month = parts
        .next()
        .and_then(|m| m.split('-').next())
        .and_then(parse_month);
    Some(format_date(year, month, None))
}

fn format_date(year: &str, month: Option<u32>, day: Option<u32>) -> String {
    match (month, day) {
        (Some(month), Some(day)) => format!("{year}-{month:02}-{day:02}"),
        (Some(month), None) => format!("{year}-{month:02}"),
        _ => year.to_string(),
    }
}

fn is_year(value: &str) -> bool {
    value.len() == 4 && value.chars().all(|ch| ch.is_ascii_digit())
}

fn parse_month(value: &str) -> Option<u32> {
    let value = value.trim();
    if let Ok(number) = value.parse::<u32>() {
        return (1..=12).contains(&number).then_some(number);
    }
    const MONTHS: [&str; 12] = [
        "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
    ];
    let prefix = value.get(..3)?.to_ascii_lowercase();
    MONTHS
        .iter()
        .position(|month| *month == prefix)
        .map(|idx| idx as u32 + 1)
}

fn parse_day(value: &str) -> Option<u32> {
    value
        .trim()
        .parse::<u32>()
        .ok()
        .filter(|day| (1..=31).contains(day))
}

/// `123-9` style ranges expand the abbreviated end page.
fn split_page_range(pages: &str) -> (Option<String>, Option<String>) {
    let mut split = pages.splitn(2, '-');
    let start = split.next().map(str::trim).filter(|s| !s.is_empty());
    let end = split.next().map(str::trim).filter(|s| !s.is_empty());
    let end = match (start, end) {
        (Some(start), Some(end))
            if end.len() < start.len() && end.chars().all(|ch| ch.is_ascii_digit()) =>
        {
            start
                .get(..start.len() - end.len())
                .map(|head| format!("{head}{end}"))
        }
        (_, end) => end.map(str::to_string),
    };
    (start.map(str::to_string), end)
}

fn dedup_preserving_order(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for value in values {
        if !value.is_empty() && !out.contains(&value) {
            out.push(value);
        }
    }
    out
}
