//! Example: preview a price from variables and formulas

use ratecard::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let variables = VariableSnapshot::from_records(vec![
        Variable::new("base_credits", 40.0).with_category("base"),
        Variable::new("complexityMultiplier", 1.2).with_category("multipliers"),
        Variable::new("agentMultiplier", 1.2).with_category("multipliers"),
        Variable::new("scenarioMultiplier", 0.8).with_category("multipliers"),
    ])?;

    let formulas = FormulaRegistry::from_records(vec![
        FormulaRecord::new("adjusted", "base_credits * complexityMultiplier * agentMultiplier")
            .with_name("Adjusted credits"),
        FormulaRecord::new("per_registration", "adjusted * scenarioMultiplier")
            .with_name("Credits per registration"),
    ])?;

    let pipeline = CalculationPipeline::new(PipelineOptions::default());

    // Nothing selected: the built-in stages run
    let trace = pipeline.run(&CalculationRequest::Default, &variables, &formulas);
    for step in &trace.steps {
        println!("{:>2}. {}: {}", step.step_index, step.formula_name, step.explanation);
    }
    println!("Monthly cost: {}", trace.final_results.monthly_cost);

    // One formula selected; its dependencies are evaluated first
    let request = CalculationRequest::from_selection(["per_registration"]);
    let trace = pipeline.run(&request, &variables, &formulas);
    println!("{}", trace.to_json_pretty()?);

    Ok(())
}
