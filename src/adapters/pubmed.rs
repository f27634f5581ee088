//! PubMed E-utilities paper source.
//!
//! Endpoints used:
//!   esearch: `<base>/esearch.fcgi` (JSON), one query per specialty
//!   efetch:  `<base>/efetch.fcgi` (XML), details for the returned PMIDs
//!
//! Every HTTP request waits on the shared `pubmed` rate-limit gate, then
//! runs under its own request timeout. The "already published" questions
//! are answered by the publish ledger.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};

use crate::config::PubMedConfig;
use crate::core::error::CollaboratorError;
use crate::core::rate_limiter::RateLimiter;
use crate::domain::{PaperRecord, PublishedRef};

use super::ledger::PublishLedger;
use super::{send_checked, CandidateQuery, PaperSource};

/// Rate-limit key for NCBI requests
pub const SERVICE: &str = "pubmed";

#[derive(Debug, Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
    #[serde(default)]
    count: Option<String>,
}

pub struct PubMedSource {
    client: reqwest::Client,
    config: PubMedConfig,
    api_key: Option<String>,
    request_timeout: Option<Duration>,
    limiter: Arc<RateLimiter>,
    ledger: PublishLedger,
}

impl PubMedSource {
    pub fn new(
        client: reqwest::Client,
        config: PubMedConfig,
        limiter: Arc<RateLimiter>,
        ledger: PublishLedger,
    ) -> Self {
        Self {
            client,
            config,
            api_key: None,
            request_timeout: None,
            limiter,
            ledger,
        }
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    /// Bound each HTTP request; time spent waiting for a rate-limit slot is not counted
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Wait for a `pubmed` slot, then build a GET carrying the request timeout
    async fn paced_get(&self, endpoint: &str) -> reqwest::RequestBuilder {
        self.limiter.acquire(SERVICE).await;
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), endpoint);
        let request = self.client.get(url);
        match self.request_timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    }

    fn base_params(&self) -> Vec<(&'static str, String)> {
        let mut params = vec![("db", "pubmed".to_string()), ("tool", self.config.tool.clone())];
        if let Some(ref email) = self.config.email {
            params.push(("email", email.clone()));
        }
        if let Some(ref key) = self.api_key {
            params.push(("api_key", key.clone()));
        }
        params
    }

    /// Search one specialty and return PMIDs
    #[instrument(skip(self))]
    async fn esearch(&self, specialty: &str, days: u32, max: usize) -> Result<Vec<String>, CollaboratorError> {
        let mut params = self.base_params();
        params.push(("term", search_term(specialty, days)));
        params.push(("retmode", "json".to_string()));
        params.push(("retmax", max.to_string()));
        params.push(("sort", "relevance".to_string()));

        let request = self.paced_get("esearch.fcgi").await.query(&params);
        let response = send_checked(request).await?;

        let body: ESearchResponse = response.json().await.map_err(|e| {
            CollaboratorError::InvalidInput(format!("unexpected esearch response: {}", e))
        })?;

        debug!(
            specialty,
            count = body.esearchresult.count.as_deref().unwrap_or("0"),
            returned = body.esearchresult.idlist.len(),
            "PubMed esearch returned PMIDs"
        );
        Ok(body.esearchresult.idlist)
    }

    /// Fetch details for `pmids`
    #[instrument(skip(self, pmids), fields(count = pmids.len()))]
    async fn efetch(&self, pmids: &[String], specialty: &str) -> Result<Vec<PaperRecord>, CollaboratorError> {
        if pmids.is_empty() {
            return Ok(Vec::new());
        }

        let mut params = self.base_params();
        params.push(("id", pmids.join(",")));
        params.push(("rettype", "abstract".to_string()));
        params.push(("retmode", "xml".to_string()));

        let request = self.paced_get("efetch.fcgi").await.query(&params);
        let xml = send_checked(request)
            .await?
            .text()
            .await
            .map_err(super::classify_transport)?;

        Ok(parse_efetch_xml(&xml)
            .into_iter()
            .map(|paper| paper.with_specialty(specialty))
            .collect())
    }
}

#[async_trait]
impl PaperSource for PubMedSource {
    async fn list_recent_candidates(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<PaperRecord>, CollaboratorError> {
        let per_query = self.config.max_results_per_query.min(query.max_results.max(1));
        let mut seen = HashSet::new();
        let mut papers = Vec::new();

        for specialty in &query.specialties {
            let pmids = self.esearch(specialty, query.days, per_query).await?;
            let fresh: Vec<String> = pmids.into_iter().filter(|id| !seen.contains(id)).collect();

            for paper in self.efetch(&fresh, specialty).await? {
                if seen.insert(paper.id.clone()) {
                    papers.push(paper);
                }
            }
        }

        papers.truncate(query.max_results);
        info!(count = papers.len(), specialties = ?query.specialties, "Fetched candidate papers");
        Ok(papers)
    }

    async fn is_already_published(&self, paper_id: &str) -> Result<bool, CollaboratorError> {
        Ok(self.ledger.is_published(paper_id).await?)
    }

    async fn mark_published(
        &self,
        paper_id: &str,
        published: &PublishedRef,
    ) -> Result<(), CollaboratorError> {
        Ok(self.ledger.record(paper_id, published).await?)
    }
}

/// `<specialty>[MeSH Terms] AND <from>:<to>[pdat] AND hasabstract[text]`
pub fn search_term(specialty: &str, days: u32) -> String {
    let end = Utc::now();
    let start = end - ChronoDuration::days(i64::from(days));
    format!(
        "{}[MeSH Terms] AND {}:{}[pdat] AND hasabstract[text]",
        specialty,
        start.format("%Y/%m/%d"),
        end.format("%Y/%m/%d")
    )
}

/// Open-access PDF for a PMC article
fn pmc_pdf_url(pmcid: &str) -> String {
    format!("https://europepmc.org/articles/{}?pdf=render", pmcid)
}

#[derive(Default)]
struct ArticleBuilder {
    record: Option<PaperRecord>,
    pmid: String,
    abstract_parts: Vec<String>,
    abstract_part: String,
    last_name: String,
    fore_name: String,
    collective_name: String,
    year: String,
    month: String,
    day: String,
    medline_date: String,
    pmcid: Option<String>,
}

impl ArticleBuilder {
    fn start() -> Self {
        Self {
            record: Some(PaperRecord::new("", "")),
            ..Default::default()
        }
    }

    fn finish(self) -> Option<PaperRecord> {
        let mut record = self.record?;
        record.id = self.pmid;
        record.title = record.title.trim().to_string();
        record.abstract_text = self.abstract_parts.join(" ");
        record.publication_date = if self.year.is_empty() {
            self.medline_date
        } else {
            [self.year, self.month, self.day]
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join(" ")
        };
        record.pdf_url = self.pmcid.as_deref().map(pmc_pdf_url);

        if record.id.is_empty() || record.title.is_empty() {
            warn!(pmid = %record.id, "Skipping article without id or title");
            return None;
        }
        Some(record)
    }
}

fn attribute(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.try_get_attribute(name)
        .ok()
        .flatten()
        .and_then(|attr| attr.unescape_value().ok().map(|v| v.into_owned()))
}

/// Parse efetch XML (`<PubmedArticleSet><PubmedArticle>...`) into records.
/// Malformed XML ends parsing; articles completed before that are kept.
pub fn parse_efetch_xml(xml: &str) -> Vec<PaperRecord> {
    let mut papers = Vec::new();
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<ArticleBuilder> = None;
    // IdType / EIdType of the id element being read
    let mut id_type: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                let name = e.name().as_ref().to_vec();
                match name.as_slice() {
                    b"PubmedArticle" => current = Some(ArticleBuilder::start()),
                    b"ArticleId" => id_type = attribute(e, "IdType"),
                    b"ELocationID" => id_type = attribute(e, "EIdType"),
                    b"AbstractText" => {
                        if let Some(ref mut article) = current {
                            article.abstract_part.clear();
                            if let Some(label) = attribute(e, "Label") {
                                article.abstract_part.push_str(&label);
                                article.abstract_part.push_str(": ");
                            }
                        }
                    }
                    b"Author" => {
                        if let Some(ref mut article) = current {
                            article.last_name.clear();
                            article.fore_name.clear();
                            article.collective_name.clear();
                        }
                    }
                    _ => {}
                }
                stack.push(name);
            }
            Ok(Event::Text(ref e)) => {
                let Some(ref mut article) = current else {
                    continue;
                };
                let text = e.unescape().map(|t| t.into_owned()).unwrap_or_default();
                apply_text(article, &stack, id_type.as_deref(), &text);
            }
            Ok(Event::End(ref e)) => {
                stack.pop();
                match e.name().as_ref() {
                    b"AbstractText" => {
                        if let Some(ref mut article) = current {
                            let part = std::mem::take(&mut article.abstract_part);
                            if !part.trim().is_empty() {
                                article.abstract_parts.push(part.trim().to_string());
                            }
                        }
                    }
                    b"Author" => {
                        if let Some(ref mut article) = current {
                            let name = if !article.collective_name.is_empty() {
                                article.collective_name.clone()
                            } else if article.fore_name.is_empty() {
                                article.last_name.clone()
                            } else {
                                format!("{} {}", article.fore_name, article.last_name)
                            };
                            if !name.is_empty() {
                                if let Some(ref mut record) = article.record {
                                    record.authors.push(name);
                                }
                            }
                        }
                    }
                    b"ArticleId" | b"ELocationID" => id_type = None,
                    b"PubmedArticle" => {
                        if let Some(paper) = current.take().and_then(ArticleBuilder::finish) {
                            papers.push(paper);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                warn!("XML parse error: {}", e);
                break;
            }
            _ => {}
        }
    }

    papers
}

fn apply_text(article: &mut ArticleBuilder, stack: &[Vec<u8>], id_type: Option<&str>, text: &str) {
    let Some(element) = stack.last() else {
        return;
    };
    let parent = stack.len().checked_sub(2).map(|i| stack[i].as_slice());
    let in_element = |name: &[u8]| stack.iter().any(|e| e.as_slice() == name);

    // Inline markup (<i>, <sup>) inside titles and abstracts
    if in_element(b"ArticleTitle") {
        if let Some(ref mut record) = article.record {
            if !record.title.is_empty() {
                record.title.push(' ');
            }
            record.title.push_str(text);
        }
        return;
    }
    if in_element(b"AbstractText") {
        if !article.abstract_part.is_empty() && !article.abstract_part.ends_with(' ') {
            article.abstract_part.push(' ');
        }
        article.abstract_part.push_str(text);
        return;
    }

    let Some(ref mut record) = article.record else {
        return;
    };

    match element.as_slice() {
        b"PMID" if parent == Some(b"MedlineCitation".as_slice()) && article.pmid.is_empty() => {
            article.pmid = text.to_string();
        }
        b"LastName" => article.last_name = text.to_string(),
        b"ForeName" => article.fore_name = text.to_string(),
        b"CollectiveName" => article.collective_name = text.to_string(),
        b"Title" if parent == Some(b"Journal".as_slice()) => record.journal = text.to_string(),
        b"Year" if in_element(b"PubDate") => article.year = text.to_string(),
        b"Month" if in_element(b"PubDate") => article.month = text.to_string(),
        b"Day" if in_element(b"PubDate") => article.day = text.to_string(),
        b"MedlineDate" => article.medline_date = text.to_string(),
        b"ArticleId" | b"ELocationID" => match id_type {
            Some("doi") if record.doi.is_none() => record.doi = Some(text.to_string()),
            Some("pmc") if article.pmcid.is_none() => article.pmcid = Some(text.to_string()),
            _ => {}
        },
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<PubmedArticleSet>
  <PubmedArticle>
    <MedlineCitation>
      <PMID Version="1">38000001</PMID>
      <Article>
        <Journal>
          <JournalIssue>
            <PubDate><Year>2024</Year><Month>Mar</Month><Day>05</Day></PubDate>
          </JournalIssue>
          <Title>The Lancet</Title>
        </Journal>
        <ArticleTitle>Statins &amp; outcomes in <i>older</i> adults</ArticleTitle>
        <ELocationID EIdType="doi">10.1000/lancet.1</ELocationID>
        <Abstract>
          <AbstractText Label="BACKGROUND">Statins are common.</AbstractText>
          <AbstractText Label="RESULTS">Mortality fell.</AbstractText>
        </Abstract>
        <AuthorList>
          <Author><LastName>Smith</LastName><ForeName>Jane</ForeName></Author>
          <Author><CollectiveName>Heart Trialists</CollectiveName></Author>
        </AuthorList>
      </Article>
      <CommentsCorrectionsList>
        <CommentsCorrections><PMID>11111111</PMID></CommentsCorrections>
      </CommentsCorrectionsList>
    </MedlineCitation>
    <PubmedData>
      <ArticleIdList>
        <ArticleId IdType="pubmed">38000001</ArticleId>
        <ArticleId IdType="pmc">PMC1234567</ArticleId>
      </ArticleIdList>
    </PubmedData>
  </PubmedArticle>
  <PubmedArticle>
    <MedlineCitation>
      <PMID>38000002</PMID>
      <Article>
        <Journal>
          <JournalIssue><PubDate><MedlineDate>2024 Jan-Feb</MedlineDate></PubDate></JournalIssue>
          <Title>BMJ</Title>
        </Journal>
        <ArticleTitle>Second paper</ArticleTitle>
      </Article>
    </MedlineCitation>
  </PubmedArticle>
</PubmedArticleSet>"#;

    #[test]
    fn test_parse_full_article() {
        let papers = parse_efetch_xml(SAMPLE);
        assert_eq!(papers.len(), 2);

        let first = &papers[0];
        assert_eq!(first.id, "38000001");
        assert_eq!(first.title, "Statins & outcomes in older adults");
        assert_eq!(first.journal, "The Lancet");
        assert_eq!(first.publication_date, "2024 Mar 05");
        assert_eq!(first.doi.as_deref(), Some("10.1000/lancet.1"));
        assert_eq!(
            first.pdf_url.as_deref(),
            Some("https://europepmc.org/articles/PMC1234567?pdf=render")
        );
        assert_eq!(first.authors, vec!["Jane Smith", "Heart Trialists"]);
        assert_eq!(
            first.abstract_text,
            "BACKGROUND: Statins are common. RESULTS: Mortality fell."
        );
    }

    #[test]
    fn test_parse_sparse_article() {
        let papers = parse_efetch_xml(SAMPLE);
        let second = &papers[1];

        assert_eq!(second.id, "38000002");
        assert_eq!(second.publication_date, "2024 Jan-Feb");
        assert!(second.doi.is_none());
        assert!(second.pdf_url.is_none());
        assert!(second.abstract_text.is_empty());
    }

    #[test]
    fn test_truncated_xml_keeps_complete_articles() {
        let cut = SAMPLE.find("<PMID>38000002").unwrap();
        let papers = parse_efetch_xml(&SAMPLE[..cut]);
        assert_eq!(papers.len(), 1);
    }

    #[test]
    fn test_search_term_shape() {
        let term = search_term("cardiology", 7);
        assert!(term.starts_with("cardiology[MeSH Terms] AND "));
        assert!(term.contains("[pdat]"));
        assert!(term.ends_with("hasabstract[text]"));
    }

    #[tokio::test]
    async fn test_requests_carry_their_own_timeout() {
        let mut limits = std::collections::HashMap::new();
        limits.insert(SERVICE.to_string(), 20.0);
        let source = PubMedSource::new(
            reqwest::Client::new(),
            PubMedConfig::default(),
            Arc::new(RateLimiter::new(&limits)),
            PublishLedger::new(std::env::temp_dir().join("medibrief-unused.jsonl")),
        )
        .with_request_timeout(Duration::from_secs(5));

        // The second request queues for a slot before its timeout applies
        source.paced_get("esearch.fcgi").await;
        let request = source.paced_get("efetch.fcgi").await.build().unwrap();

        assert_eq!(request.timeout(), Some(&Duration::from_secs(5)));
        assert!(request.url().path().ends_with("/efetch.fcgi"));
    }
}
