use lex_core::{Invoice, InvoiceAnalysisRequest, PrecheckSeverity};

/// 系统提示词组装
///
/// 段落顺序固定：角色说明 → 必填字段 → 预检结果 → 相似案例 → 法规语境。
/// 法规段只在检索到内容时出现，模型不会看到空的法规标题。
pub fn build_system_prompt(request: &InvoiceAnalysisRequest) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "Du bist ein Prüfassistent für Rechnungen in EU-geförderten Projekten. \
         Bewerte die vorliegende Rechnung fachlich und wirtschaftlich und antworte \
         ausschließlich mit einem JSON-Objekt mit genau diesen Feldern: \
         semantic_check, economic_check, beneficiary_match, warnings (Liste), \
         overall_assessment (approved | review_required | rejected), confidence (0.0-1.0). \
         Kein Text außerhalb des JSON.\n",
    );

    if !request.mandatory_fields.is_empty() {
        prompt.push_str("\n## Pflichtangaben\n");
        prompt.push_str("Folgende Felder müssen auf der Rechnung vorhanden sein:\n");
        for field in &request.mandatory_fields {
            prompt.push_str(&format!("- {}\n", field));
        }
    }

    if !request.precheck_findings.is_empty() {
        prompt.push_str("\n## Vorprüfung\n");
        for finding in &request.precheck_findings {
            let severity = match finding.severity {
                PrecheckSeverity::Info => "INFO",
                PrecheckSeverity::Warning => "WARNUNG",
                PrecheckSeverity::Error => "FEHLER",
            };
            prompt.push_str(&format!(
                "- [{}] {}: {}\n",
                severity, finding.field, finding.message
            ));
        }
    }

    if let Some(project) = &request.project_context {
        prompt.push_str("\n## Projektkontext\n");
        prompt.push_str(project);
        prompt.push('\n');
    }
    if let Some(beneficiary) = &request.beneficiary_context {
        prompt.push_str("\n## Begünstigter\n");
        prompt.push_str(beneficiary);
        prompt.push('\n');
    }

    if !request.similar_cases.is_empty() {
        prompt.push_str("\n## Vergleichbare Fälle\n");
        for case in &request.similar_cases {
            prompt.push_str(&format!(
                "- Fall {}: {} (Ergebnis: {})\n",
                case.case_id, case.summary, case.outcome
            ));
        }
    }

    if let Some(entries) = &request.legal_context {
        if !entries.is_empty() {
            prompt.push_str("\n## Einschlägige Rechtsgrundlagen\n");
            prompt.push_str(
                "Berücksichtige die folgenden Vorschriften. Zitiere sie in deiner \
                 Begründung mit der angegebenen Fundstelle:\n",
            );
            for (i, entry) in entries.iter().enumerate() {
                prompt.push_str(&format!(
                    "[{}] {} ({}): {}\n",
                    i + 1,
                    entry.norm_citation,
                    entry.source_kind,
                    entry.content
                ));
            }
        }
    }

    prompt
}

/// 用户提示词：发票字段的键值列表，缺失字段标记为 fehlt
pub fn build_user_prompt(invoice: &Invoice) -> String {
    let fmt_opt = |v: &Option<String>| v.clone().unwrap_or_else(|| "fehlt".to_string());
    let fmt_amount = |v: &Option<f64>| {
        v.map(|a| format!("{:.2}", a))
            .unwrap_or_else(|| "fehlt".to_string())
    };

    let mut prompt = String::from("Zu prüfende Rechnung:\n");
    prompt.push_str(&format!(
        "Rechnungsnummer: {}\n",
        fmt_opt(&invoice.invoice_number)
    ));
    prompt.push_str(&format!("Lieferant: {}\n", fmt_opt(&invoice.supplier)));
    prompt.push_str(&format!(
        "Begünstigter: {}\n",
        fmt_opt(&invoice.beneficiary)
    ));
    prompt.push_str(&format!(
        "Rechnungsdatum: {}\n",
        fmt_opt(&invoice.invoice_date)
    ));
    prompt.push_str(&format!("Nettobetrag: {}\n", fmt_amount(&invoice.net_amount)));
    prompt.push_str(&format!(
        "Umsatzsteuer: {}\n",
        fmt_amount(&invoice.vat_amount)
    ));
    prompt.push_str(&format!(
        "Bruttobetrag: {}\n",
        fmt_amount(&invoice.gross_amount)
    ));
    prompt.push_str(&format!("Währung: {}\n", fmt_opt(&invoice.currency)));
    prompt.push_str(&format!(
        "Leistungsbeschreibung: {}\n",
        fmt_opt(&invoice.service_description)
    ));
    prompt.push_str(&format!(
        "Leistungszeitraum: {}\n",
        fmt_opt(&invoice.service_period)
    ));
    prompt.push_str(&format!(
        "Kostenkategorie: {}\n",
        fmt_opt(&invoice.cost_category)
    ));
    prompt
}
