//! Portuguese email bodies for new-document alerts and the daily digest.

use chrono::NaiveDate;
use nfe_core::FiscalDocument;
use serde::Serialize;

use crate::channel::{DailyDigest, Recipient};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub subject: String,
    pub html: String,
}

#[derive(Debug, Clone)]
pub struct EmailRenderer {
    pub from_name: String,
    pub dashboard_url: String,
}

impl Default for EmailRenderer {
    fn default() -> Self {
        Self {
            from_name: "NFe Monitor".to_string(),
            dashboard_url: "http://localhost:8501".to_string(),
        }
    }
}

impl EmailRenderer {
    pub fn new(from_name: impl Into<String>, dashboard_url: impl Into<String>) -> Self {
        Self {
            from_name: from_name.into(),
            dashboard_url: dashboard_url.into(),
        }
    }

    pub fn document_email(&self, recipient: &Recipient, document: &FiscalDocument) -> EmailMessage {
        let subject = format!("Nova NFe detectada — {}", recipient.company_name);
        let number = match (&document.nfe_number, &document.series) {
            (Some(number), Some(series)) => format!("{number} (série {series})"),
            (Some(number), None) => number.clone(),
            (None, _) => "-".to_string(),
        };

        let html = format!(
            r#"<html>
<body>
  <h2>Nova NFe detectada para {company}</h2>
  <p>Encontramos uma nova Nota Fiscal Eletrônica emitida contra o CNPJ {cnpj}.</p>
  <table border="1" cellpadding="8" cellspacing="0" style="border-collapse: collapse; width: 100%;">
    <thead style="background: #1F4E79; color: white;">
      <tr><th>Número NFe</th><th>Emitente</th><th>Data Emissão</th><th>Valor</th></tr>
    </thead>
    <tbody>
      <tr><td>{number}</td><td>{issuer}</td><td>{date}</td><td>{value}</td></tr>
    </tbody>
  </table>
  <p style="font-size: 12px;">Chave de acesso: {access_key}</p>
{footer}
</body>
</html>"#,
            company = escape_html(&recipient.company_name),
            cnpj = recipient.tax_id.formatted(),
            number = escape_html(&number),
            issuer = escape_html(&document.issuer_name),
            date = format_date_br(document.issue_date),
            value = format_brl(document.total_value),
            access_key = escape_html(&document.key.access_key),
            footer = self.footer("Ver no Dashboard"),
        );

        EmailMessage { subject, html }
    }

    pub fn digest_email(&self, recipient: &Recipient, digest: &DailyDigest) -> EmailMessage {
        let subject = format!(
            "Resumo diário {} — {} documento(s)",
            self.from_name,
            digest.document_count()
        );

        let rows: String = digest
            .documents
            .iter()
            .map(|doc| {
                format!(
                    "      <tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                    escape_html(doc.nfe_number.as_deref().unwrap_or("-")),
                    escape_html(&doc.issuer_name),
                    format_date_br(doc.issue_date),
                    format_brl(doc.total_value),
                )
            })
            .collect();

        let html = format!(
            r#"<html>
<body>
  <h2>Resumo Diário — {day}</h2>
  <p>{company} (CNPJ {cnpj})</p>
  <p>Novos documentos nas últimas 24h: <strong>{count}</strong></p>
  <p>Valor total: <strong>{total}</strong></p>
  <table border="1" cellpadding="8" cellspacing="0" style="border-collapse: collapse; width: 100%;">
    <tbody>
{rows}    </tbody>
  </table>
{footer}
</body>
</html>"#,
            day = format_date_br(digest.until.date_naive()),
            company = escape_html(&recipient.company_name),
            cnpj = recipient.tax_id.formatted(),
            count = digest.document_count(),
            total = format_brl(digest.total_value()),
            rows = rows,
            footer = self.footer("Ver detalhes"),
        );

        EmailMessage { subject, html }
    }

    fn footer(&self, link_text: &str) -> String {
        format!(
            r#"  <p style="margin-top: 20px;"><a href="{url}">{link_text}</a></p>
  <p style="color: #666; font-size: 12px; margin-top: 30px;">Este é um email automático do {from}.</p>"#,
            url = escape_html(&self.dashboard_url),
            from = escape_html(&self.from_name),
        )
    }
}

/// Brazilian currency layout: `R$ 1.234,56`.
pub fn format_brl(value: f64) -> String {
    let cents = (value * 100.0).round() as i64;
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    let whole = (cents / 100).to_string();
    let fraction = cents % 100;

    let mut grouped = String::with_capacity(whole.len() + whole.len() / 3);
    for (i, ch) in whole.chars().enumerate() {
        if i > 0 && (whole.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    format!("{sign}R$ {grouped},{fraction:02}")
}

pub fn format_date_br(date: NaiveDate) -> String {
    date.format("%d/%m/%Y").to_string()
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
