//! Local DANFSe rendering from an NFSe document.
//!
//! The authority also serves the official PDF (see
//! [`crate::api::NfseClient::download_danfse`]); this renderer works offline
//! from the XML and accepts a custom letterhead.
use crate::codec::{self, CodecError};
use crate::dps::Amount;
use crate::nfse::{NfseDocument, ParseError, Party, parse_nfse_xml};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use printpdf::image_crate::GenericImageView;
use printpdf::path::PaintMode;
use printpdf::{
    BuiltinFont, Color, Image, ImageTransform, IndirectFontRef, Line, Mm, PdfDocument,
    PdfDocumentReference, PdfLayerReference, Point, Rect, Rgb,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

const PAGE_WIDTH: f32 = 210.0;
const PAGE_HEIGHT: f32 = 297.0;
const MARGIN: f32 = 10.0;
const CONTENT_WIDTH: f32 = PAGE_WIDTH - 2.0 * MARGIN;
const ROW_HEIGHT: f32 = 9.0;
const BAND_HEIGHT: f32 = 5.5;
const LABEL_SIZE: f32 = 6.0;
const VALUE_SIZE: f32 = 8.5;
const LOGO_HEIGHT: f32 = 18.0;

#[derive(Debug, Error)]
pub enum DanfseError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to load header image {}: {message}", path.display())]
    Image { path: PathBuf, message: String },
    #[error("PDF rendering failed: {0}")]
    Render(String),
}

/// Letterhead printed above the DANFSe body.
///
/// # Examples
/// ```rust
/// use nfse_core::danfse::HeaderConfig;
///
/// let header = HeaderConfig::default()
///     .with_title("Clinica Exemplo")
///     .with_phone("11999999999");
/// assert!(header.has_custom_header());
/// assert!(!HeaderConfig::default().has_custom_header());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderConfig {
    image_path: Option<PathBuf>,
    title: String,
    subtitle: String,
    phone: String,
    email: String,
}

impl HeaderConfig {
    /// Logo in any format the `image` crate decodes (PNG, JPEG, ...).
    pub fn with_image(mut self, path: impl Into<PathBuf>) -> Self {
        self.image_path = Some(path.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_subtitle(mut self, subtitle: impl Into<String>) -> Self {
        self.subtitle = subtitle.into();
        self
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.phone = phone.into();
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = email.into();
        self
    }

    pub fn image_path(&self) -> Option<&Path> {
        self.image_path.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn subtitle(&self) -> &str {
        &self.subtitle
    }

    pub fn phone(&self) -> &str {
        &self.phone
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// A title or a logo replaces the default heading.
    pub fn has_custom_header(&self) -> bool {
        self.image_path.is_some() || !self.title.trim().is_empty()
    }
}

/// Render the DANFSe of `nfse` as a single A4 PDF.
///
/// # Examples
/// ```rust,no_run
/// use nfse_core::danfse::{HeaderConfig, render_danfse};
/// use nfse_core::nfse::parse_nfse_xml;
///
/// let nfse = parse_nfse_xml(&std::fs::read_to_string("nfse.xml")?)?;
/// let pdf = render_danfse(&nfse, &HeaderConfig::default())?;
/// std::fs::write("danfse.pdf", pdf)?;
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub fn render_danfse(nfse: &NfseDocument, header: &HeaderConfig) -> Result<Vec<u8>, DanfseError> {
    let title = format!("DANFSe {}", nfse.access_key());
    let (doc, page, layer) = PdfDocument::new(title, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "DANFSe");
    let layer = doc.get_page(page).get_layer(layer);
    let mut canvas = Canvas {
        regular: doc.add_builtin_font(BuiltinFont::Helvetica).map_err(render_error)?,
        bold: doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(render_error)?,
        doc,
        layer,
        y: PAGE_HEIGHT - MARGIN,
    };

    canvas.header(header)?;
    canvas.identification(nfse);
    canvas.party("PRESTADOR / EMITENTE", Some(nfse.issuer()));
    canvas.party("TOMADOR DO SERVICO", nfse.recipient());
    canvas.service(nfse);
    canvas.taxation(nfse);
    canvas.totals(nfse);
    canvas.footer();

    let bytes = canvas.doc.save_to_bytes().map_err(render_error)?;
    tracing::debug!(access_key = %nfse.access_key(), bytes = bytes.len(), "DANFSe rendered");
    Ok(bytes)
}

/// Parse an NFSe XML document and render its DANFSe.
pub fn render_danfse_from_xml(xml: &str, header: &HeaderConfig) -> Result<Vec<u8>, DanfseError> {
    render_danfse(&parse_nfse_xml(xml)?, header)
}

/// Render from the gzip+base64 form the authority returns in
/// `nfseXmlGZipB64`.
pub fn render_danfse_from_base64(
    encoded: &str,
    header: &HeaderConfig,
) -> Result<Vec<u8>, DanfseError> {
    let xml = codec::decode(encoded.trim())?;
    render_danfse_from_xml(&xml, header)
}

fn render_error(e: printpdf::Error) -> DanfseError {
    DanfseError::Render(e.to_string())
}

struct Canvas {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    /// Top of the next block, in mm from the bottom edge.
    y: f32,
}

impl Canvas {
    fn header(&mut self, header: &HeaderConfig) -> Result<(), DanfseError> {
        let top = self.y;
        if !header.has_custom_header() {
            self.text("DANFSe v1.0", 14.0, MARGIN, top - 6.0, true);
            self.text(
                "Documento Auxiliar da Nota Fiscal de Servico Eletronica",
                9.0,
                MARGIN,
                top - 11.0,
                false,
            );
            self.y = top - 14.0;
            self.rule();
            return Ok(());
        }

        let mut x = MARGIN;
        if let Some(path) = header.image_path() {
            self.logo(path, top - LOGO_HEIGHT)?;
            x += LOGO_HEIGHT * 2.0 + 4.0;
        }
        let mut line_y = top - 6.0;
        if !header.title().is_empty() {
            self.text(header.title(), 13.0, x, line_y, true);
            line_y -= 5.0;
        }
        if !header.subtitle().is_empty() {
            self.text(header.subtitle(), 9.0, x, line_y, false);
            line_y -= 4.5;
        }
        let contact: Vec<String> = [format_phone(header.phone()), header.email().to_string()]
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect();
        if !contact.is_empty() {
            self.text(&contact.join("  |  "), 8.0, x, line_y, false);
            line_y -= 4.5;
        }
        self.text(
            "DANFSe - Documento Auxiliar da NFS-e",
            8.0,
            PAGE_WIDTH - MARGIN - 55.0,
            top - 6.0,
            true,
        );
        self.y = line_y.min(top - LOGO_HEIGHT) - 2.0;
        self.rule();
        Ok(())
    }

    fn logo(&self, path: &Path, bottom: f32) -> Result<(), DanfseError> {
        let image = printpdf::image_crate::open(path).map_err(|e| DanfseError::Image {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let height_px = image.height().max(1) as f32;
        // At `dpi`, the image is exactly LOGO_HEIGHT tall.
        let dpi = height_px * 25.4 / LOGO_HEIGHT;
        Image::from_dynamic_image(&image).add_to_layer(
            self.layer.clone(),
            ImageTransform {
                translate_x: Some(Mm(MARGIN)),
                translate_y: Some(Mm(bottom)),
                dpi: Some(dpi),
                ..Default::default()
            },
        );
        Ok(())
    }

    fn identification(&mut self, nfse: &NfseDocument) {
        self.band("CHAVE DE ACESSO DA NFS-e");
        self.row(&[("Chave de acesso", nfse.access_key().to_string())]);
        self.row(&[
            ("Numero da NFS-e", or_dash(nfse.number())),
            ("Competencia", or_dash(nfse.competence().map(format_date).as_deref())),
            (
                "Data e hora da emissao da NFS-e",
                or_dash(nfse.processed_at().map(format_datetime).as_deref()),
            ),
        ]);
        self.row(&[
            ("Numero da DPS", or_dash(nfse.dps_number())),
            ("Serie da DPS", or_dash(nfse.dps_series())),
            (
                "Data e hora da emissao da DPS",
                or_dash(nfse.issued_at().map(format_datetime).as_deref()),
            ),
        ]);
        self.row(&[
            ("Local de emissao", or_dash(nfse.emission_location())),
            ("Local de incidencia do ISSQN", or_dash(nfse.incidence_location())),
        ]);
    }

    fn party(&mut self, title: &str, party: Option<&Party>) {
        self.band(title);
        let Some(party) = party else {
            self.row(&[("", "TOMADOR DO SERVICO NAO IDENTIFICADO NA NFS-e".to_string())]);
            return;
        };
        self.row(&[
            ("CNPJ / CPF / NIF", or_dash(party.tax_id().map(format_tax_id).as_deref())),
            ("Inscricao municipal", or_dash(party.municipal_registration())),
            ("Telefone", or_dash(party.phone().map(format_phone).as_deref())),
        ]);
        self.row(&[
            ("Nome / Nome empresarial", or_dash(party.name())),
            ("E-mail", or_dash(party.email())),
        ]);
        if let Some(address) = party.address() {
            let street = [address.street(), address.number(), address.district()]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(", ");
            self.row(&[
                ("Endereco", if street.is_empty() { "-".into() } else { street }),
                ("UF", or_dash(address.state())),
                ("CEP", or_dash(address.postal_code().map(format_cep).as_deref())),
            ]);
        }
    }

    fn service(&mut self, nfse: &NfseDocument) {
        self.band("SERVICO PRESTADO");
        self.row(&[
            ("Codigo de tributacao nacional", or_dash(nfse.national_tax_code())),
            ("Codigo de tributacao municipal", or_dash(nfse.municipal_tax_code())),
            ("Local da prestacao", or_dash(nfse.service_location())),
        ]);
        let description = nfse.service_description().unwrap_or("-");
        self.paragraph("Descricao do servico", description);
    }

    fn taxation(&mut self, nfse: &NfseDocument) {
        self.band("TRIBUTACAO MUNICIPAL");
        self.row(&[
            (
                "Tributacao do ISSQN",
                nfse.iss_taxation().map_or("-", iss_taxation_description).to_string(),
            ),
            (
                "Retencao do ISSQN",
                nfse.iss_retention().map_or("-", iss_retention_description).to_string(),
            ),
        ]);
        self.row(&[
            (
                "Opcao pelo Simples Nacional",
                nfse.simples_nacional().map_or("-", simples_nacional_description).to_string(),
            ),
            (
                "Regime de apuracao (Simples Nacional)",
                nfse.simples_nacional_regime()
                    .map_or("-", simples_nacional_regime_description)
                    .to_string(),
            ),
        ]);
        self.row(&[
            ("Base de calculo", format_currency(nfse.calculation_base())),
            ("Aliquota aplicada", nfse.iss_rate().map_or("-".into(), format_percent)),
            ("ISSQN apurado", format_currency(nfse.iss_amount())),
        ]);
    }

    fn totals(&mut self, nfse: &NfseDocument) {
        self.band("VALOR TOTAL DA NFS-e");
        self.row(&[
            ("Valor do servico", format_currency(nfse.service_amount())),
            ("Valor liquido da NFS-e", format_currency(nfse.net_amount())),
        ]);
    }

    fn footer(&mut self) {
        self.y -= 4.0;
        self.text(
            "A autenticidade desta NFS-e pode ser verificada no portal nacional pela chave de acesso.",
            LABEL_SIZE + 1.0,
            MARGIN,
            self.y,
            false,
        );
    }

    /// Grey title band across the content width.
    fn band(&mut self, title: &str) {
        self.reserve(BAND_HEIGHT + ROW_HEIGHT);
        let bottom = self.y - BAND_HEIGHT;
        self.layer.set_fill_color(grey(0.88));
        self.layer.add_rect(
            Rect::new(Mm(MARGIN), Mm(bottom), Mm(MARGIN + CONTENT_WIDTH), Mm(self.y))
                .with_mode(PaintMode::FillStroke),
        );
        self.layer.set_fill_color(grey(0.0));
        self.text(title, 7.5, MARGIN + 1.5, bottom + 1.6, true);
        self.y = bottom;
    }

    /// Boxed cells of equal width: a small label over its value.
    fn row(&mut self, cells: &[(&str, String)]) {
        self.reserve(ROW_HEIGHT);
        let bottom = self.y - ROW_HEIGHT;
        let width = CONTENT_WIDTH / cells.len().max(1) as f32;
        for (index, (label, value)) in cells.iter().enumerate() {
            let left = MARGIN + width * index as f32;
            self.layer.add_rect(
                Rect::new(Mm(left), Mm(bottom), Mm(left + width), Mm(self.y))
                    .with_mode(PaintMode::Stroke),
            );
            if !label.is_empty() {
                self.text(label, LABEL_SIZE, left + 1.2, self.y - 2.8, false);
            }
            let value = fit(value, width - 2.4, VALUE_SIZE);
            self.text(&value, VALUE_SIZE, left + 1.2, bottom + 1.8, true);
        }
        self.y = bottom;
    }

    /// Labelled box holding wrapped free text.
    fn paragraph(&mut self, label: &str, text: &str) {
        let lines = wrap(text, chars_for(CONTENT_WIDTH - 2.4, VALUE_SIZE - 0.5));
        let height = 4.0 + lines.len() as f32 * 3.8 + 1.5;
        self.reserve(height);
        let bottom = self.y - height;
        self.layer.add_rect(
            Rect::new(Mm(MARGIN), Mm(bottom), Mm(MARGIN + CONTENT_WIDTH), Mm(self.y))
                .with_mode(PaintMode::Stroke),
        );
        self.text(label, LABEL_SIZE, MARGIN + 1.2, self.y - 2.8, false);
        let mut line_y = self.y - 6.5;
        for line in &lines {
            self.text(line, VALUE_SIZE - 0.5, MARGIN + 1.2, line_y, false);
            line_y -= 3.8;
        }
        self.y = bottom;
    }

    fn rule(&mut self) {
        self.layer.set_outline_thickness(0.8);
        self.layer.add_line(Line {
            points: vec![
                (Point::new(Mm(MARGIN), Mm(self.y)), false),
                (Point::new(Mm(MARGIN + CONTENT_WIDTH), Mm(self.y)), false),
            ],
            is_closed: false,
        });
        self.layer.set_outline_thickness(0.3);
        self.y -= 3.0;
    }

    /// Start a new page unless `height` still fits above the bottom margin.
    fn reserve(&mut self, height: f32) {
        if self.y - height >= MARGIN {
            return;
        }
        let (page, layer) = self
            .doc
            .add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "DANFSe");
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.layer.set_outline_thickness(0.3);
        self.y = PAGE_HEIGHT - MARGIN;
    }

    fn text(&self, text: &str, size: f32, x: f32, y: f32, bold: bool) {
        let font = if bold { &self.bold } else { &self.regular };
        self.layer.use_text(text, size, Mm(x), Mm(y), font);
    }
}

fn grey(level: f32) -> Color {
    Color::Rgb(Rgb::new(level, level, level, None))
}

fn or_dash(value: Option<&str>) -> String {
    value.filter(|v| !v.is_empty()).unwrap_or("-").to_string()
}

/// Characters of Helvetica at `size` pt that fit in `width` mm, taking an
/// average glyph as half an em.
fn chars_for(width: f32, size: f32) -> usize {
    let glyph_mm = size * 0.5 * 25.4 / 72.0;
    (width / glyph_mm).max(1.0) as usize
}

fn fit(text: &str, width: f32, size: f32) -> String {
    let max = chars_for(width, size);
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

fn wrap(text: &str, max: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();
    for word in text.split_whitespace() {
        if !current.is_empty() && current.chars().count() + 1 + word.chars().count() > max {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}

/// `2026-01-15T10:30:00-03:00` to `15/01/2026 10:30:00`, in the offset the
/// timestamp was written with. Unparseable input is returned as is.
pub fn format_datetime(value: &str) -> String {
    let value = value.trim();
    if let Ok(timestamp) = DateTime::parse_from_rfc3339(value) {
        return timestamp.format("%d/%m/%Y %H:%M:%S").to_string();
    }
    if let Ok(timestamp) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return timestamp.format("%d/%m/%Y %H:%M:%S").to_string();
    }
    value.to_string()
}

/// `2026-01-15` (or a full timestamp) to `15/01/2026`.
pub fn format_date(value: &str) -> String {
    let value = value.trim();
    let date = value.get(..10).and_then(|head| NaiveDate::parse_from_str(head, "%Y-%m-%d").ok());
    match date {
        Some(date) => date.format("%d/%m/%Y").to_string(),
        None => value.to_string(),
    }
}

/// Brazilian phone layout for 10 or 11 digits; other lengths come back as
/// bare digits.
pub fn format_phone(value: &str) -> String {
    let digits = digits(value);
    match digits.len() {
        11 => format!("({}) {}-{}", &digits[..2], &digits[2..7], &digits[7..]),
        10 => format!("({}) {}-{}", &digits[..2], &digits[2..6], &digits[6..]),
        _ => digits,
    }
}

/// `R$ 1.234.567,89`; `-` when absent.
pub fn format_currency(amount: Option<Amount>) -> String {
    let Some(amount) = amount else {
        return "-".to_string();
    };
    let cents = amount.cents();
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    format!("R$ {sign}{},{:02}", group_thousands(cents / 100), cents % 100)
}

/// `2,00%` for a `pAliqAplic` of 2.00.
pub fn format_percent(rate: Amount) -> String {
    let cents = rate.cents().unsigned_abs();
    let sign = if rate.cents() < 0 { "-" } else { "" };
    format!("{sign}{},{:02}%", cents / 100, cents % 100)
}

/// `13000000` to `13000-000`.
pub fn format_cep(value: &str) -> String {
    let digits = digits(value);
    if digits.len() == 8 {
        format!("{}-{}", &digits[..5], &digits[5..])
    } else {
        value.trim().to_string()
    }
}

/// CNPJ and CPF punctuation; anything else (NIF) is left alone.
pub fn format_tax_id(value: &str) -> String {
    let d = digits(value);
    match d.len() {
        14 => format!("{}.{}.{}/{}-{}", &d[..2], &d[2..5], &d[5..8], &d[8..12], &d[12..]),
        11 => format!("{}.{}.{}-{}", &d[..3], &d[3..6], &d[6..9], &d[9..]),
        _ => value.trim().to_string(),
    }
}

/// `opSimpNac`.
pub fn simples_nacional_description(code: &str) -> &'static str {
    match code.trim() {
        "1" => "Nao Optante",
        "2" => "Optante - Microempreendedor Individual (MEI)",
        "3" => "Optante - Microempresa ou Empresa de Pequeno Porte (ME/EPP)",
        _ => "-",
    }
}

/// `regApTribSN`.
pub fn simples_nacional_regime_description(code: &str) -> &'static str {
    match code.trim() {
        "1" => "Tributos federais e municipal pelo Simples Nacional",
        "2" => "Tributos federais pelo Simples Nacional; ISSQN pela NFS-e",
        "3" => "Tributos federais e municipal fora do Simples Nacional",
        _ => "-",
    }
}

/// `tribISSQN`.
pub fn iss_taxation_description(code: &str) -> &'static str {
    match code.trim() {
        "1" => "Operacao Tributavel",
        "2" => "Imunidade",
        "3" => "Exportacao de Servico",
        "4" => "Nao Incidencia",
        _ => "-",
    }
}

/// `tpRetISSQN`.
pub fn iss_retention_description(code: &str) -> &'static str {
    match code.trim() {
        "1" => "Nao Retido",
        "2" => "Retido pelo Tomador",
        "3" => "Retido pelo Intermediario",
        _ => "-",
    }
}

fn digits(value: &str) -> String {
    value.chars().filter(char::is_ascii_digit).collect()
}

fn group_thousands(value: u64) -> String {
    let plain = value.to_string();
    let mut grouped = String::with_capacity(plain.len() + plain.len() / 3);
    for (index, ch) in plain.chars().enumerate() {
        if index > 0 && (plain.len() - index) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(ch);
    }
    grouped
}
